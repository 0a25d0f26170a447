use std::path::PathBuf;

use shadow_core::{DiffError, VersionId};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("journal I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt journal record at {}:{line}: {message}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("golden trace integrity violation at entry {sequence}: {reason}")]
    IntegrityViolation { sequence: u64, reason: String },

    #[error("configuration version {0} not found")]
    VersionNotFound(VersionId),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] DiffError),
}

impl LedgerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
