use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ssh2::Session;
use tokio::sync::mpsc;

use super::{CommandOutput, ExecutionBackend, TailHandle};
use crate::backend::sh_quote;
use crate::error::{Error, Result};

const CHUNK: usize = 32 * 1024;
/// Session-level poll interval; blocking reads wake this often so deadline
/// and cancellation checks stay responsive.
const POLL_MS: u32 = 1000;

#[derive(Clone)]
struct ConnectParams {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    key_path: Option<PathBuf>,
}

/// Executes everything over one held SSH session. The session is owned
/// exclusively by this instance and closed when it drops. A dropped session
/// is reconnected exactly once per call before `Execution` is surfaced;
/// failures after a command has begun streaming are never retried.
pub struct RemoteBackend {
    inner: Arc<Inner>,
}

struct Inner {
    session: Mutex<Option<Session>>,
    params: ConnectParams,
}

impl RemoteBackend {
    pub async fn connect(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        key_path: Option<&str>,
    ) -> Result<Self> {
        let username = username
            .map(str::to_string)
            .or_else(|| std::env::var("USER").ok())
            .ok_or_else(|| Error::Validation("ssh username is required".into()))?;
        let params = ConnectParams {
            host: host.to_string(),
            port,
            username,
            password: password.map(str::to_string),
            key_path: key_path.map(PathBuf::from),
        };

        let session = {
            let params = params.clone();
            tokio::task::spawn_blocking(move || establish(&params))
                .await
                .map_err(|e| Error::Execution(format!("ssh connect task failed: {e}")))??
        };

        Ok(Self {
            inner: Arc::new(Inner {
                session: Mutex::new(Some(session)),
                params,
            }),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| Error::Execution(format!("ssh task failed: {e}")))?
    }
}

fn establish(params: &ConnectParams) -> Result<Session> {
    let addr = format!("{}:{}", params.host, params.port);
    let tcp = TcpStream::connect(&addr)
        .map_err(|e| Error::Execution(format!("tcp connect to {addr} failed: {e}")))?;
    let mut session = Session::new()
        .map_err(|e| Error::Execution(format!("ssh session init failed: {e}")))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| Error::Execution(format!("ssh handshake with {addr} failed: {e}")))?;

    if let Some(key) = &params.key_path {
        session
            .userauth_pubkey_file(&params.username, None, key, None)
            .map_err(|e| Error::Execution(format!("ssh key auth failed: {e}")))?;
    } else if let Some(password) = &params.password {
        session
            .userauth_password(&params.username, password)
            .map_err(|e| Error::Execution(format!("ssh password auth failed: {e}")))?;
    } else {
        session
            .userauth_agent(&params.username)
            .map_err(|e| Error::Execution(format!("ssh agent auth failed: {e}")))?;
    }

    session.set_timeout(POLL_MS);
    Ok(session)
}

impl Inner {
    /// Open an exec channel, reconnecting the held session at most once if
    /// it has gone away. This is the only retry point in the backend.
    fn exec_channel(&self, cmd: &str) -> Result<ssh2::Channel> {
        let mut guard = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(session) = guard.as_ref() {
            if let Ok(channel) = open_exec(session, cmd) {
                return Ok(channel);
            }
            tracing::warn!(host = %self.params.host, "ssh session dropped, reconnecting once");
        }

        let session = establish(&self.params)?;
        let channel = open_exec(&session, cmd)?;
        *guard = Some(session);
        Ok(channel)
    }

    fn sftp(&self) -> Result<ssh2::Sftp> {
        let mut guard = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(session) = guard.as_ref() {
            if let Ok(sftp) = session.sftp() {
                return Ok(sftp);
            }
            tracing::warn!(host = %self.params.host, "ssh session dropped, reconnecting once");
        }

        let session = establish(&self.params)?;
        let sftp = session
            .sftp()
            .map_err(|e| Error::Execution(format!("sftp open failed: {e}")))?;
        *guard = Some(session);
        Ok(sftp)
    }
}

fn open_exec(session: &Session, cmd: &str) -> Result<ssh2::Channel> {
    let mut channel = session
        .channel_session()
        .map_err(|e| Error::Execution(format!("ssh channel open failed: {e}")))?;
    channel
        .exec(cmd)
        .map_err(|e| Error::Execution(format!("ssh exec failed: {e}")))?;
    Ok(channel)
}

fn is_poll_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

/// Drain a channel stream into `sink`, honouring the wall-clock deadline.
fn drain<R: Read, W: Write>(
    reader: &mut R,
    sink: &mut W,
    deadline: Instant,
    cmd: &str,
    timeout_secs: u64,
) -> Result<()> {
    let mut buf = [0u8; CHUNK];
    loop {
        // The deadline must hold even when the command streams continuously
        // and no read ever blocks, so it is checked on data as well as on
        // poll wakeups.
        match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                sink.write_all(&buf[..n])
                    .map_err(|e| Error::Execution(format!("write of command output failed: {e}")))?;
                if Instant::now() >= deadline {
                    return Err(Error::Timeout {
                        command: cmd.to_string(),
                        seconds: timeout_secs,
                    });
                }
            }
            Err(e) if is_poll_timeout(&e) => {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout {
                        command: cmd.to_string(),
                        seconds: timeout_secs,
                    });
                }
            }
            Err(e) => return Err(Error::Execution(format!("ssh read failed: {e}"))),
        }
    }
}

fn finish_channel(mut channel: ssh2::Channel, cmd: &str) -> Result<i32> {
    channel
        .wait_close()
        .map_err(|e| Error::Execution(format!("ssh close of `{cmd}` failed: {e}")))?;
    channel
        .exit_status()
        .map_err(|e| Error::Execution(format!("ssh exit status of `{cmd}` unavailable: {e}")))
}

#[async_trait]
impl ExecutionBackend for RemoteBackend {
    async fn run(&self, cmd: &str, timeout_secs: u64) -> Result<CommandOutput> {
        let cmd = cmd.to_string();
        self.blocking(move |inner| {
            let mut channel = inner.exec_channel(&cmd)?;
            let deadline = Instant::now() + Duration::from_secs(timeout_secs);

            let mut stdout = Vec::new();
            drain(&mut channel, &mut stdout, deadline, &cmd, timeout_secs)?;
            let mut stderr = Vec::new();
            drain(
                &mut channel.stderr(),
                &mut stderr,
                deadline,
                &cmd,
                timeout_secs,
            )?;

            let exit_code = finish_channel(channel, &cmd)?;
            Ok(CommandOutput {
                exit_code,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        })
        .await
    }

    async fn run_to_file(
        &self,
        cmd: &str,
        dest: &Path,
        timeout_secs: u64,
    ) -> Result<CommandOutput> {
        let cmd = cmd.to_string();
        let dest = dest.to_path_buf();
        self.blocking(move |inner| {
            let mut channel = inner.exec_channel(&cmd)?;
            let deadline = Instant::now() + Duration::from_secs(timeout_secs);

            let mut file = std::fs::File::create(&dest).map_err(|e| Error::io(&dest, e))?;
            drain(&mut channel, &mut file, deadline, &cmd, timeout_secs)?;
            file.flush().map_err(|e| Error::io(&dest, e))?;

            let mut stderr = Vec::new();
            drain(
                &mut channel.stderr(),
                &mut stderr,
                deadline,
                &cmd,
                timeout_secs,
            )?;

            let exit_code = finish_channel(channel, &cmd)?;
            Ok(CommandOutput {
                exit_code,
                stdout: String::new(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        })
        .await
    }

    async fn run_with_stdin_file(
        &self,
        cmd: &str,
        src: &Path,
        timeout_secs: u64,
    ) -> Result<CommandOutput> {
        let cmd = cmd.to_string();
        let src = src.to_path_buf();
        self.blocking(move |inner| {
            let mut channel = inner.exec_channel(&cmd)?;
            let deadline = Instant::now() + Duration::from_secs(timeout_secs);

            let mut file = std::fs::File::open(&src).map_err(|e| Error::io(&src, e))?;
            let mut buf = [0u8; CHUNK];
            loop {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout {
                        command: cmd.clone(),
                        seconds: timeout_secs,
                    });
                }
                let n = file.read(&mut buf).map_err(|e| Error::io(&src, e))?;
                if n == 0 {
                    break;
                }
                channel
                    .write_all(&buf[..n])
                    .map_err(|e| Error::Execution(format!("ssh stdin write failed: {e}")))?;
            }
            channel
                .send_eof()
                .map_err(|e| Error::Execution(format!("ssh eof failed: {e}")))?;

            let mut stdout = Vec::new();
            drain(&mut channel, &mut stdout, deadline, &cmd, timeout_secs)?;
            let mut stderr = Vec::new();
            drain(
                &mut channel.stderr(),
                &mut stderr,
                deadline,
                &cmd,
                timeout_secs,
            )?;

            let exit_code = finish_channel(channel, &cmd)?;
            Ok(CommandOutput {
                exit_code,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        })
        .await
    }

    async fn read_file(&self, path: &Path, local_dest: &Path) -> Result<()> {
        let path = path.to_path_buf();
        let local_dest = local_dest.to_path_buf();
        self.blocking(move |inner| {
            let sftp = inner.sftp()?;
            let mut remote = sftp
                .open(&path)
                .map_err(|e| Error::Execution(format!("sftp open {} failed: {e}", path.display())))?;
            let mut local = std::fs::File::create(&local_dest)
                .map_err(|e| Error::io(&local_dest, e))?;
            std::io::copy(&mut remote, &mut local)
                .map_err(|e| Error::Execution(format!("sftp download of {} failed: {e}", path.display())))?;
            Ok(())
        })
        .await
    }

    async fn write_file(&self, local_src: &Path, path: &Path) -> Result<()> {
        let local_src = local_src.to_path_buf();
        let path = path.to_path_buf();
        self.blocking(move |inner| {
            let sftp = inner.sftp()?;
            let mut local = std::fs::File::open(&local_src).map_err(|e| Error::io(&local_src, e))?;
            let mut remote = sftp
                .create(&path)
                .map_err(|e| Error::Execution(format!("sftp create {} failed: {e}", path.display())))?;
            std::io::copy(&mut local, &mut remote)
                .map_err(|e| Error::Execution(format!("sftp upload to {} failed: {e}", path.display())))?;
            Ok(())
        })
        .await
    }

    async fn file_exists(&self, path: &Path) -> Result<bool> {
        let cmd = format!("test -f {}", sh_quote(&path.to_string_lossy()));
        Ok(self.run(&cmd, 30).await?.success())
    }

    async fn dir_exists(&self, path: &Path) -> Result<bool> {
        let cmd = format!("test -d {}", sh_quote(&path.to_string_lossy()));
        Ok(self.run(&cmd, 30).await?.success())
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
        // A dedicated session per follow: libssh2 sessions are not safe for
        // concurrent channel traffic, and the watcher must be closeable
        // independently of the operation's own commands.
        let params = self.inner.params.clone();
        let cmd = format!("tail -n 0 -F {}", sh_quote(&path.to_string_lossy()));

        let (tx, rx) = mpsc::channel(1024);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_task = stop.clone();

        let task = tokio::task::spawn_blocking(move || {
            let session = match establish(&params) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("tail follow session failed: {e}");
                    return;
                }
            };
            let mut channel = match open_exec(&session, &cmd) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("tail follow exec failed: {e}");
                    return;
                }
            };

            let mut pending = String::new();
            let mut buf = [0u8; 4096];
            while !stop_for_task.load(Ordering::SeqCst) {
                match channel.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                        while let Some(idx) = pending.find('\n') {
                            let line = pending[..idx].to_string();
                            pending.drain(..=idx);
                            if tx.blocking_send(line).is_err() {
                                let _ = channel.close();
                                return;
                            }
                        }
                    }
                    Err(e) if is_poll_timeout(&e) => continue,
                    Err(_) => break,
                }
            }
            let _ = channel.close();
        });

        Ok(TailHandle::new(rx, stop, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that yields one byte per call, like a command whose stdout
    /// never pauses long enough for a poll timeout.
    struct FloodReader {
        remaining: usize,
    }

    impl Read for FloodReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.remaining == 0 {
                return Ok(0);
            }
            self.remaining -= 1;
            buf[0] = b'x';
            Ok(1)
        }
    }

    #[test]
    fn drain_times_out_even_while_data_keeps_flowing() {
        let mut reader = FloodReader { remaining: 10_000 };
        let mut sink = Vec::new();
        let deadline = Instant::now()
            .checked_sub(Duration::from_secs(3600))
            .unwrap_or_else(Instant::now);

        let err = drain(&mut reader, &mut sink, deadline, "pg_dump", 1).unwrap_err();
        assert!(matches!(err, Error::Timeout { seconds: 1, .. }));
        // The first chunk may land before the deadline check trips.
        assert!(sink.len() < 10_000);
    }

    #[test]
    fn drain_copies_everything_inside_the_deadline() {
        let mut reader = FloodReader { remaining: 64 };
        let mut sink = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(30);

        drain(&mut reader, &mut sink, deadline, "pg_dump", 30).unwrap();
        assert_eq!(sink.len(), 64);
    }
}
