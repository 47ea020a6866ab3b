//! RPC status carried by stream error notifications

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::TransportError;

/// Well-known RPC status codes (gRPC numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    /// Numeric wire value of this code
    pub fn as_i32(self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Cancelled => 1,
            StatusCode::Unknown => 2,
            StatusCode::InvalidArgument => 3,
            StatusCode::DeadlineExceeded => 4,
            StatusCode::NotFound => 5,
            StatusCode::AlreadyExists => 6,
            StatusCode::PermissionDenied => 7,
            StatusCode::ResourceExhausted => 8,
            StatusCode::FailedPrecondition => 9,
            StatusCode::Aborted => 10,
            StatusCode::OutOfRange => 11,
            StatusCode::Unimplemented => 12,
            StatusCode::Internal => 13,
            StatusCode::Unavailable => 14,
            StatusCode::DataLoss => 15,
            StatusCode::Unauthenticated => 16,
        }
    }

    /// Map a numeric wire value back to a known code
    pub fn from_i32(code: i32) -> Option<Self> {
        let code = match code {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            2 => StatusCode::Unknown,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            _ => return None,
        };
        Some(code)
    }
}

/// Code/message pair reported by a failed stream
///
/// The code is kept as a raw integer so that transports can pass through
/// values outside the well-known set; use [`RpcStatus::status_code`] to
/// interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("RPC status {code}: {message}")]
pub struct RpcStatus {
    pub code: i32,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_i32(),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    /// The well-known code, if the raw value is one
    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_i32(self.code)
    }
}

impl From<&TransportError> for RpcStatus {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::InvalidMethod(_) => Self::new(StatusCode::Unimplemented, err.to_string()),
            TransportError::Unsupported(_) => Self::new(StatusCode::Unimplemented, err.to_string()),
            TransportError::Protocol(_) => Self::internal(err.to_string()),
            TransportError::ConnectionFailed(_) | TransportError::ConnectionClosed => {
                Self::unavailable(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip_covers_known_range() {
        for raw in 0..=16 {
            let code = StatusCode::from_i32(raw).unwrap();
            assert_eq!(code.as_i32(), raw);
        }
        assert_eq!(StatusCode::from_i32(17), None);
        assert_eq!(StatusCode::from_i32(-1), None);
    }

    #[test]
    fn test_transport_error_maps_to_status() {
        let status = RpcStatus::from(&TransportError::ConnectionFailed("refused".into()));
        assert_eq!(status.status_code(), Some(StatusCode::Unavailable));
        assert!(status.message.contains("refused"));

        let status = RpcStatus::from(&TransportError::InvalidMethod("/x.Y/Z".into()));
        assert_eq!(status.status_code(), Some(StatusCode::Unimplemented));
    }

    #[test]
    fn test_display() {
        let status = RpcStatus::unavailable("backend restarting");
        assert_eq!(status.to_string(), "RPC status 14: backend restarting");
    }
}
