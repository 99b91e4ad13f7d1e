use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{CommandOutput, ExecutionBackend, TailHandle};
use crate::backend::sh_quote;
use crate::error::{Error, Result};

/// Executes commands and file I/O directly against the local machine.
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }

    fn shell(cmd: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        command
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_lossy<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    async fn run(&self, cmd: &str, timeout_secs: u64) -> Result<CommandOutput> {
        let mut child = Self::shell(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Execution(format!("failed to start `{cmd}`: {e}")))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let result = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            let (out, err, status) =
                tokio::join!(read_lossy(stdout), read_lossy(stderr), child.wait());
            (out, err, status)
        })
        .await;

        match result {
            Ok((stdout, stderr, status)) => {
                let status =
                    status.map_err(|e| Error::Execution(format!("wait on `{cmd}` failed: {e}")))?;
                Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                })
            }
            Err(_) => {
                let _ = child.start_kill();
                Err(Error::Timeout {
                    command: cmd.to_string(),
                    seconds: timeout_secs,
                })
            }
        }
    }

    async fn run_to_file(
        &self,
        cmd: &str,
        dest: &Path,
        timeout_secs: u64,
    ) -> Result<CommandOutput> {
        let mut child = Self::shell(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Execution(format!("failed to start `{cmd}`: {e}")))?;

        let mut stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| Error::io(dest, e))?;

        let result = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            let copy = tokio::io::copy(&mut stdout, &mut file);
            let (copied, err, status) = tokio::join!(copy, read_lossy(stderr), child.wait());
            (copied, err, status)
        })
        .await;

        match result {
            Ok((copied, stderr, status)) => {
                copied.map_err(|e| Error::io(dest, e))?;
                let status =
                    status.map_err(|e| Error::Execution(format!("wait on `{cmd}` failed: {e}")))?;
                Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: String::new(),
                    stderr,
                })
            }
            Err(_) => {
                let _ = child.start_kill();
                Err(Error::Timeout {
                    command: cmd.to_string(),
                    seconds: timeout_secs,
                })
            }
        }
    }

    async fn run_with_stdin_file(
        &self,
        cmd: &str,
        src: &Path,
        timeout_secs: u64,
    ) -> Result<CommandOutput> {
        let mut child = Self::shell(cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Execution(format!("failed to start `{cmd}`: {e}")))?;

        let mut stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let mut file = tokio::fs::File::open(src)
            .await
            .map_err(|e| Error::io(src, e))?;

        let result = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            let feed = async {
                let copied = tokio::io::copy(&mut file, &mut stdin).await;
                drop(stdin); // close stdin so the command sees EOF
                copied
            };
            let (fed, out, err, status) =
                tokio::join!(feed, read_lossy(stdout), read_lossy(stderr), child.wait());
            (fed, out, err, status)
        })
        .await;

        match result {
            Ok((fed, stdout, stderr, status)) => {
                fed.map_err(|e| Error::io(src, e))?;
                let status =
                    status.map_err(|e| Error::Execution(format!("wait on `{cmd}` failed: {e}")))?;
                Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                })
            }
            Err(_) => {
                let _ = child.start_kill();
                Err(Error::Timeout {
                    command: cmd.to_string(),
                    seconds: timeout_secs,
                })
            }
        }
    }

    async fn read_file(&self, path: &Path, local_dest: &Path) -> Result<()> {
        tokio::fs::copy(path, local_dest)
            .await
            .map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    async fn write_file(&self, local_src: &Path, path: &Path) -> Result<()> {
        tokio::fs::copy(local_src, path)
            .await
            .map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    async fn file_exists(&self, path: &Path) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    async fn dir_exists(&self, path: &Path) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    async fn tail(&self, path: &Path, n: usize) -> Result<Vec<String>> {
        let cmd = format!("tail -n {} {}", n, sh_quote(&path.to_string_lossy()));
        let out = self.run(&cmd, 30).await?;
        if !out.success() {
            return Err(Error::Execution(format!(
                "tail of {} failed: {}",
                path.display(),
                out.stderr.trim()
            )));
        }
        Ok(out.stdout.lines().map(String::from).collect())
    }

    async fn tail_follow(&self, path: &Path) -> Result<TailHandle> {
        let mut child = Command::new("tail")
            .arg("-n")
            .arg("0")
            .arg("-F")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Execution(format!("failed to start tail -F: {e}")))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let (tx, rx) = mpsc::channel(1024);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_task = stop.clone();

        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                if stop_for_task.load(Ordering::SeqCst) {
                    break;
                }
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            // Dropping `child` here kills the tail process (kill_on_drop).
            drop(child);
        });

        Ok(TailHandle::new(rx, stop, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn run_captures_exit_code_and_output() {
        let backend = LocalBackend::new();
        let out = backend.run("echo hello; echo oops >&2; exit 3", 10).await.unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn run_times_out() {
        let backend = LocalBackend::new();
        let err = backend.run("sleep 5", 1).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { seconds: 1, .. }));
    }

    #[tokio::test]
    async fn run_to_file_streams_stdout() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.txt");
        let out = backend
            .run_to_file("printf 'line1\\nline2\\n'", &dest, 10)
            .await
            .unwrap();
        assert!(out.success());
        let content = std::fs::read_to_string(&dest).unwrap();
        assert_eq!(content, "line1\nline2\n");
    }

    #[tokio::test]
    async fn run_with_stdin_file_feeds_input() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.txt");
        std::fs::write(&src, "a\nb\nc\n").unwrap();
        let out = backend.run_with_stdin_file("wc -l", &src, 10).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "3");
    }

    #[tokio::test]
    async fn tail_returns_last_lines() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        std::fs::write(&path, "1\n2\n3\n4\n5\n").unwrap();
        let lines = backend.tail(&path, 2).await.unwrap();
        assert_eq!(lines, vec!["4", "5"]);
    }

    #[tokio::test]
    async fn tail_follow_sees_appended_lines_and_stops_on_cancel() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.log");
        std::fs::write(&path, "").unwrap();

        let mut handle = backend.tail_follow(&path).await.unwrap();
        // Give tail a moment to attach before appending.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "first").unwrap();
        writeln!(file, "second").unwrap();
        file.flush().unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), handle.next_line())
            .await
            .expect("line within deadline")
            .expect("stream open");
        let second = tokio::time::timeout(Duration::from_secs(5), handle.next_line())
            .await
            .expect("line within deadline")
            .expect("stream open");
        assert_eq!(first, "first");
        assert_eq!(second, "second");

        handle.cancel();
        let after = tokio::time::timeout(Duration::from_secs(2), handle.next_line()).await;
        assert!(matches!(after, Ok(None)));
    }

    #[tokio::test]
    async fn existence_probes() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "x").unwrap();
        assert!(backend.file_exists(&file).await.unwrap());
        assert!(!backend.file_exists(&dir.path().join("missing")).await.unwrap());
        assert!(backend.dir_exists(dir.path()).await.unwrap());
        assert!(!backend.dir_exists(&file).await.unwrap());
    }
}
