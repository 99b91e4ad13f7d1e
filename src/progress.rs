use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::types::{ProgressEvent, Severity, Stage};

/// Single-producer side of an operation's ordered progress stream.
///
/// Events are fire-and-forget: a consumer that hung up does not fail the
/// operation. Ordering is preserved; delivery is not synchronous with the
/// stage transition the event describes.
#[derive(Clone)]
pub struct Reporter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl Reporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A reporter whose events go nowhere. Handy for tests and for the
    /// fused operation's inner legs.
    pub fn sink() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn emit(&self, stage: Stage, severity: Severity, message: impl Into<String>) {
        self.emit_percent(stage, severity, message, None);
    }

    pub fn emit_percent(
        &self,
        stage: Stage,
        severity: Severity,
        message: impl Into<String>,
        percent: Option<u8>,
    ) {
        let _ = self.tx.send(ProgressEvent {
            stage,
            severity,
            message: message.into(),
            percent,
        });
    }

    pub fn stage(&self, stage: Stage, message: impl Into<String>) {
        self.emit(stage, Severity::Info, message);
    }

    pub fn success(&self, stage: Stage, message: impl Into<String>) {
        self.emit(stage, Severity::Success, message);
    }

    pub fn warn(&self, stage: Stage, message: impl Into<String>) {
        self.emit(stage, Severity::Warning, message);
    }

    pub fn failed(&self, message: impl Into<String>) {
        self.emit(Stage::Failed, Severity::Error, message);
    }
}

/// Cooperative cancellation observed at stage boundaries only. A stage
/// already in flight runs to completion or to its own timeout; there is no
/// hard kill of an external process mid-write.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Stage-boundary check used by the engines before starting `next`.
    pub fn checkpoint(&self, next: Stage) -> crate::error::Result<()> {
        if self.is_cancelled() {
            return Err(crate::error::Error::Execution(format!(
                "operation cancelled before {next}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (reporter, mut rx) = Reporter::channel();
        reporter.stage(Stage::Preparing, "start");
        reporter.stage(Stage::DumpingDatabase, "dump");
        reporter.success(Stage::Done, "done");

        assert_eq!(rx.recv().await.unwrap().stage, Stage::Preparing);
        assert_eq!(rx.recv().await.unwrap().stage, Stage::DumpingDatabase);
        let last = rx.recv().await.unwrap();
        assert_eq!(last.stage, Stage::Done);
        assert_eq!(last.severity, Severity::Success);
    }

    #[test]
    fn emit_after_consumer_drop_is_harmless() {
        let (reporter, rx) = Reporter::channel();
        drop(rx);
        reporter.failed("nobody listening");
    }

    #[test]
    fn cancel_flag_is_sticky() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        flag.cancel();
        assert!(flag.is_cancelled());
        assert!(flag.clone().is_cancelled());
    }
}
