//! rstream-core - Core traits and types for resilient streaming RPC clients
//!
//! This crate provides the abstractions that the reconnecting stream
//! controller is written against:
//!
//! - [`Transport`] / [`StreamHandle`]: opening a server-streaming call and
//!   receiving its lifecycle [`Notification`]s
//! - [`BackoffPolicy`]: the pluggable wait-interval policy, plus the stock
//!   [`ExponentialBackoff`] and [`ConstantBackoff`] implementations
//! - [`StreamEvent`] and friends: what observers of a stream receive

pub mod backoff;
pub mod error;
pub mod event;
pub mod metadata;
pub mod status;
pub mod transport;

pub use backoff::{BackoffPolicy, ConstantBackoff, ExponentialBackoff};
pub use error::{TransportError, TransportResult};
pub use event::{DataPayload, EventKind, RetryEvent, StreamEvent};
pub use metadata::Metadata;
pub use status::{RpcStatus, StatusCode};
pub use transport::{MethodId, Notification, NotificationStream, StreamHandle, Transport};
