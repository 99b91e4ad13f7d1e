use std::path::PathBuf;

/// Error taxonomy shared by the backend, archive and engine layers.
///
/// `Validation` and `Safety` are always raised before any destination
/// mutation and are never retried. `Timeout` is per `run` call. `Archive`
/// aborts a restore before the destination is touched.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("command timed out after {seconds}s: {command}")]
    Timeout { command: String, seconds: u64 },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("safety check failed: {0}")]
    Safety(String),

    #[error("profile store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata serialization error: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The short kind tag used in final log lines and exit reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Execution(_) => "execution",
            Self::Timeout { .. } => "timeout",
            Self::Archive(_) => "archive",
            Self::Safety(_) => "safety",
            Self::Store(_) => "store",
            Self::Io { .. } => "io",
            Self::Metadata(_) => "metadata",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
