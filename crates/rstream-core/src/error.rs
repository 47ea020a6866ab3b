//! Transport layer errors

use thiserror::Error;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors a [`Transport`](crate::Transport) can report when opening a stream
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}
