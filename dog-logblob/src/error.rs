use std::time::Duration;

use thiserror::Error;

/// Result type for blob operations
pub type BlobResult<T> = Result<T, BlobError>;

/// Result type for operations on the underlying log
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur during blob operations
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Block {index} is not available locally")]
    BlockNotAvailable { index: u64 },

    #[error("Request timed out after {timeout:?}")]
    RequestTimeout { timeout: Duration },

    #[error("Append failed: {source}")]
    AppendFailed {
        #[source]
        source: LogError,
    },

    #[error("Invalid range: {message}")]
    InvalidRange { message: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Log error: {source}")]
    Log {
        #[from]
        source: LogError,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

/// Errors reported by a [`BlockLog`](crate::BlockLog) implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("Log is closed")]
    Closed,

    #[error("Block {index} is out of bounds (length {length})")]
    OutOfBounds { index: u64, length: u64 },

    #[error("Log backend error: {0}")]
    Backend(String),
}

impl BlobError {
    /// Create a block-not-available error
    pub fn not_available(index: u64) -> Self {
        Self::BlockNotAvailable { index }
    }

    /// Create a request timeout error
    pub fn timeout(timeout: Duration) -> Self {
        Self::RequestTimeout { timeout }
    }

    /// Wrap a log error raised while appending
    pub fn append_failed(source: LogError) -> Self {
        Self::AppendFailed { source }
    }

    /// Create an invalid range error
    pub fn invalid_range<S: Into<String>>(message: S) -> Self {
        Self::InvalidRange {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::BlockNotAvailable { .. } => "BLOCK_NOT_AVAILABLE",
            Self::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Self::AppendFailed { .. } => "APPEND_FAILED",
            Self::InvalidRange { .. } => "INVALID_RANGE",
            Self::Invalid { .. } => "INVALID_REQUEST",
            Self::Log { .. } => "LOG_ERROR",
            Self::Io { .. } => "IO_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }

    /// Whether the caller can reasonably retry or treat the failure as absence
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BlockNotAvailable { .. } | Self::RequestTimeout { .. }
        )
    }
}
