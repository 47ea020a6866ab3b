//! Transport trait and notification types
//!
//! A [`Transport`] opens one server-streaming call and hands back a
//! [`StreamHandle`]. The handle exposes the call's lifecycle as a stream of
//! [`Notification`]s and can be cancelled.
//!
//! # Example
//!
//! ```ignore
//! let mut handle = transport.open(&method, &request, &metadata).await?;
//! let mut notifications = handle.notifications().expect("fresh handle");
//! while let Some(notification) = notifications.next().await {
//!     println!("{:?}", notification.kind());
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::TransportResult;
use crate::event::EventKind;
use crate::metadata::Metadata;
use crate::status::RpcStatus;

/// Fully qualified RPC method, e.g. `/market.Ticker/Subscribe`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodId(Arc<str>);

impl MethodId {
    pub fn new(method: impl AsRef<str>) -> Self {
        Self(Arc::from(method.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MethodId {
    fn from(method: &str) -> Self {
        Self::new(method)
    }
}

impl From<String> for MethodId {
    fn from(method: String) -> Self {
        Self(Arc::from(method))
    }
}

/// Lifecycle notification delivered by a stream handle
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Response headers / trailers
    Metadata(Metadata),
    /// One encoded response message
    Data(Bytes),
    /// The server closed the stream
    End,
    /// The call failed
    Error(RpcStatus),
}

impl Notification {
    pub fn kind(&self) -> EventKind {
        match self {
            Notification::Metadata(_) => EventKind::Metadata,
            Notification::Data(_) => EventKind::Data,
            Notification::End => EventKind::End,
            Notification::Error(_) => EventKind::Error,
        }
    }

    /// End and Error close the call; nothing follows them
    pub fn is_terminal(&self) -> bool {
        matches!(self, Notification::End | Notification::Error(_))
    }
}

/// Stream of notifications for one call
pub type NotificationStream = BoxStream<'static, Notification>;

/// A live server-streaming call
pub trait StreamHandle: Send {
    /// Take the notification stream
    ///
    /// Returns `None` if the stream was already taken.
    fn notifications(&mut self) -> Option<NotificationStream>;

    /// Cancel the call. Must be safe to call more than once.
    fn cancel(&mut self);
}

/// Opens server-streaming calls
///
/// Implementations wrap a concrete RPC stack; request and response encoding
/// are the implementation's concern; the controller only moves bytes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a stream for `method`
    ///
    /// # Arguments
    /// * `method` - Fully qualified method identifier
    /// * `request` - Encoded request message
    /// * `metadata` - Call metadata sent with the request
    async fn open(
        &self,
        method: &MethodId,
        request: &Bytes,
        metadata: &Metadata,
    ) -> TransportResult<Box<dyn StreamHandle>>;
}
