//! Error types for the receiver and the sender.

use std::path::PathBuf;
use std::time::Duration;

use handoff_protocol::WireError;
use handoff_protocol::status;

/// Transfer id that cannot safely name a cache file.
#[derive(Debug, thiserror::Error)]
#[error("invalid transfer id: {0}")]
pub struct InvalidTransferId(pub String);

/// The cache directory or a cache file cannot be used.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("not writable: {}", .0.display())]
    ReadOnly(PathBuf),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a receive cycle failed.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connectivity failure: {0}")]
    Connectivity(#[source] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("authorization failed")]
    Forbidden,

    #[error("no receiver at {0}")]
    NotFound(String),

    #[error("method not implemented: {0}")]
    MethodNotImplemented(String),
}

impl ReceiveError {
    /// Status code reported to the sender for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Framing(_) | Self::Protocol(_) => status::BAD_REQUEST,
            Self::Connectivity(_) => status::SERVICE_UNAVAILABLE,
            Self::Storage(_) => status::INTERNAL_SERVER_ERROR,
            Self::Forbidden => status::FORBIDDEN,
            Self::NotFound(_) => status::NOT_FOUND,
            Self::MethodNotImplemented(_) => status::NOT_IMPLEMENTED,
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

impl From<WireError> for ReceiveError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Framing(msg) => Self::Framing(msg),
            WireError::Protocol(msg) => Self::Protocol(msg),
            WireError::Io(e) => Self::Connectivity(e),
        }
    }
}

impl From<InvalidTransferId> for ReceiveError {
    fn from(err: InvalidTransferId) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Why a `send_file` call failed.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Could not connect, or the stream broke mid-exchange.
    #[error("connectivity failure: {0}")]
    Connectivity(#[source] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("framing error: {0}")]
    Framing(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The receiver answered with a non-success status.
    #[error("receiver rejected transfer: {status} {reason}")]
    Rejected { status: u16, reason: String },

    /// Reading the local source file failed.
    #[error("local file error: {0}")]
    LocalIo(#[source] std::io::Error),
}

impl SendError {
    /// Connectivity failures and timeouts are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Timeout(_))
    }
}

impl From<WireError> for SendError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Framing(msg) => Self::Framing(msg),
            WireError::Protocol(msg) => Self::Protocol(msg),
            WireError::Io(e) => Self::Connectivity(e),
        }
    }
}
