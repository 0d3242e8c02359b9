use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlakarError>;

#[derive(Debug, Error)]
pub enum PlakarError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: wrong passphrase or corrupted key")]
    Auth,

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend error: {message} (retryable: {retryable})")]
    Backend { message: String, retryable: bool },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("usage: {0}")]
    Usage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("state cache error: {0}")]
    Cache(#[from] Box<redb::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlakarError {
    /// Permanent backend failure.
    pub fn backend(message: impl Into<String>) -> Self {
        PlakarError::Backend {
            message: message.into(),
            retryable: false,
        }
    }

    /// Transient backend failure worth retrying.
    pub fn backend_retryable(message: impl Into<String>) -> Self {
        PlakarError::Backend {
            message: message.into(),
            retryable: true,
        }
    }

    /// Whether a failed backend operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlakarError::Backend { retryable: true, .. })
    }

    /// Errors that should skip a single file during backup rather than
    /// abort the snapshot (permission denied, file vanished mid-scan).
    pub fn is_soft_file_error(&self) -> bool {
        match self {
            PlakarError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

/// Convert any member of the redb error family through `redb::Error`.
pub(crate) fn cache_err(e: impl Into<redb::Error>) -> PlakarError {
    PlakarError::Cache(Box::new(e.into()))
}
