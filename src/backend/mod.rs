mod local;
mod remote;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::types::{ConnectionProfile, Transport};

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Live `tail -f` stream. Cancelling (or dropping) the handle closes the
/// underlying process or channel; no watcher outlives its handle.
pub struct TailHandle {
    lines: mpsc::Receiver<String>,
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl TailHandle {
    pub(crate) fn new(
        lines: mpsc::Receiver<String>,
        stop: Arc<AtomicBool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            lines,
            stop,
            task: Some(task),
        }
    }

    /// Next appended line, or `None` once the stream is closed.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    pub fn cancel(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.lines.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TailHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Capability interface both transport variants implement identically:
/// run a command, move files, tail logs. One instance serves exactly one
/// operation and owns any remote session for its lifetime.
#[mockall::automock]
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Run a command with bounded output, killed after `timeout_secs`.
    async fn run(&self, cmd: &str, timeout_secs: u64) -> Result<CommandOutput>;

    /// Run a command streaming its stdout into a local file chunk by chunk,
    /// so multi-gigabyte dumps never sit in memory. stderr is captured
    /// (bounded) for diagnostics.
    async fn run_to_file(&self, cmd: &str, dest: &Path, timeout_secs: u64)
        -> Result<CommandOutput>;

    /// Run a command feeding a local file into its stdin, streamed.
    async fn run_with_stdin_file(
        &self,
        cmd: &str,
        src: &Path,
        timeout_secs: u64,
    ) -> Result<CommandOutput>;

    /// Copy a file from the backend's machine to a local path, chunked.
    async fn read_file(&self, path: &Path, local_dest: &Path) -> Result<()>;

    /// Copy a local file to a path on the backend's machine, chunked.
    async fn write_file(&self, local_src: &Path, path: &Path) -> Result<()>;

    async fn file_exists(&self, path: &Path) -> Result<bool>;

    async fn dir_exists(&self, path: &Path) -> Result<bool>;

    /// Last `n` lines of a file, finite snapshot.
    async fn tail(&self, path: &Path, n: usize) -> Result<Vec<String>>;

    /// Follow a file like `tail -f`; lazy, infinite, cancellable.
    async fn tail_follow(&self, path: &Path) -> Result<TailHandle>;
}

/// Build the backend variant a profile's transport fields call for. The
/// variant set is closed: local subprocess execution or one SSH session.
pub async fn connect(profile: &ConnectionProfile) -> Result<Box<dyn ExecutionBackend>> {
    match profile.transport() {
        Transport::Local => Ok(Box::new(LocalBackend::new())),
        Transport::Remote => {
            let backend = RemoteBackend::connect(
                &profile.host,
                profile.ssh_port,
                profile.ssh_username.as_deref(),
                profile.ssh_password.as_deref(),
                profile.ssh_key_path.as_deref(),
            )
            .await?;
            Ok(Box::new(backend))
        }
    }
}

/// Quote a string for inclusion in a `sh -c` command line.
pub(crate) fn sh_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sh_quote_wraps_and_escapes() {
        assert_eq!(sh_quote("plain"), "'plain'");
        assert_eq!(sh_quote("with space"), "'with space'");
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
    }

    #[tokio::test]
    async fn factory_picks_local_for_local_profiles() {
        let profile = ConnectionProfile::local("dev");
        // Just asserting it resolves without touching the network.
        let backend = connect(&profile).await.unwrap();
        let out = backend.run("true", 10).await.unwrap();
        assert!(out.success());
    }
}
