//! Errors for file operations.

use std::io;
use thiserror::Error;

/// Errors raised by the host-side file operations layer.
#[derive(Debug, Error)]
pub enum FileOpsError {
    /// The file does not exist.
    #[error("file not found: {0}")]
    NotFound(String),

    /// The file exceeds the configured size limit.
    #[error("file too large: {size} bytes exceeds limit of {max}")]
    TooLarge { size: u64, max: u64 },

    /// The file is not valid UTF-8.
    #[error("file is not valid UTF-8: {0}")]
    Decode(#[from] std::string::FromUtf8Error),

    /// A caller-supplied validation predicate rejected the content.
    #[error("content validation rejected: {0}")]
    Validation(String),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FileOpsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether retrying the operation can plausibly succeed.
    /// Validation and decode failures are deterministic; I/O is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FileOpsError::Io(_))
    }
}
