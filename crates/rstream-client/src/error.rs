//! Error types for stream client operations

use thiserror::Error;

/// Result type alias for stream client operations
pub type Result<T> = std::result::Result<T, StreamControllerError>;

/// Errors that can occur when driving a stream controller
#[derive(Error, Debug)]
pub enum StreamControllerError {
    /// The operation needs a live stream handle and `connect()` has not
    /// established one yet
    #[error("Stream is not connected: call connect() first")]
    NotConnected,
}

/// Errors raised while loading client configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config parsed but holds values the client cannot use
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors raised when converting a raw message to structured form
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("JSON decode failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
