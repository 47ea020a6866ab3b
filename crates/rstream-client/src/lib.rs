//! rstream Client Library
//!
//! A resilient server-streaming RPC client: one long-lived subscription that
//! reconnects itself after the stream ends or fails, and delivers typed
//! events to registered listeners.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rstream_client::{ExponentialBackoff, StreamBuilder, StreamOptions};
//!
//! let controller = StreamBuilder::new(transport, "/market.Ticker/Subscribe")
//!     .with_options(StreamOptions::retrying().with_is_object(true))
//!     .with_backoff(Arc::new(ExponentialBackoff::default()))
//!     .on_data(|_, payload| println!("tick: {payload:?}"), None)
//!     .on_retry(|_, retry| println!("retry #{}", retry.retries), None)
//!     .start()
//!     .await;
//! ```
//!
//! # Configuration
//!
//! Options, backoff and initial metadata can come from a TOML file, see
//! [`ClientConfig`]:
//!
//! ```rust,ignore
//! let config = ClientConfig::load_from("stream.toml")?;
//! let controller = StreamBuilder::new(transport, method).with_config(&config).build();
//! ```
//!
//! # Testing
//!
//! The `testing` module provides an in-memory transport and recorders:
//!
//! ```rust,ignore
//! use rstream_client::testing::{EventLog, MockTransport};
//!
//! let transport = MockTransport::new();
//! let controller = StreamBuilder::new(transport.clone(), "/t.S/M").start().await;
//! let log = EventLog::attach(&controller);
//! transport.emit_latest(Notification::End);
//! ```

pub mod builder;
pub mod config;
pub mod controller;
pub mod decode;
pub mod diagnostics;
pub mod error;
pub mod listeners;
pub mod testing;

pub use builder::StreamBuilder;
pub use config::{BackoffConfig, ClientConfig, ConstantConfig, ExponentialConfig, StreamOptions};
pub use controller::{ConnectionInfo, ConnectionState, StreamController};
pub use decode::{json_decoder, MessageDecoder};
pub use diagnostics::{Diagnostic, DiagnosticSink, ExpiryReason, TracingSink};
pub use error::{ConfigError, DecodeError, Result, StreamControllerError};
pub use listeners::{Listener, ListenerId, ListenerOptions};

// Re-export core types for convenience
pub use rstream_core::{
    BackoffPolicy, ConstantBackoff, DataPayload, EventKind, ExponentialBackoff, Metadata,
    MethodId, Notification, NotificationStream, RetryEvent, RpcStatus, StatusCode, StreamEvent,
    StreamHandle, Transport, TransportError, TransportResult,
};
