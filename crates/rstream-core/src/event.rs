//! Events delivered to stream observers

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;
use crate::status::RpcStatus;

/// The closed set of event kinds an observer can listen for
///
/// `Retry` is produced by the controller itself; the other four mirror the
/// transport's notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Metadata,
    Data,
    End,
    Error,
    Retry,
}

impl EventKind {
    pub const COUNT: usize = 5;

    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::Metadata,
        EventKind::Data,
        EventKind::End,
        EventKind::Error,
        EventKind::Retry,
    ];

    /// Dense index, used for fixed-size per-kind tables
    pub fn index(self) -> usize {
        match self {
            EventKind::Metadata => 0,
            EventKind::Data => 1,
            EventKind::End => 2,
            EventKind::Error => 3,
            EventKind::Retry => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Metadata => "metadata",
            EventKind::Data => "data",
            EventKind::End => "end",
            EventKind::Error => "error",
            EventKind::Retry => "retry",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details of a reconnect attempt that is about to be made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEvent {
    /// Retry counter after this attempt was counted
    pub retries: u32,
    /// Interval that was waited before this attempt
    #[serde(rename = "backoffMillis")]
    pub backoff_millis: u64,
}

/// A data message as seen by observers
#[derive(Debug, Clone, PartialEq)]
pub enum DataPayload {
    /// Message bytes exactly as the transport delivered them
    Raw(Bytes),
    /// Message decoded to a plain structured value
    Structured(serde_json::Value),
}

impl DataPayload {
    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            DataPayload::Raw(bytes) => Some(bytes),
            DataPayload::Structured(_) => None,
        }
    }

    pub fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            DataPayload::Structured(value) => Some(value),
            DataPayload::Raw(_) => None,
        }
    }
}

/// An event dispatched to observers
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Metadata(Metadata),
    Data(DataPayload),
    End,
    Error(RpcStatus),
    Retry(RetryEvent),
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Metadata(_) => EventKind::Metadata,
            StreamEvent::Data(_) => EventKind::Data,
            StreamEvent::End => EventKind::End,
            StreamEvent::Error(_) => EventKind::Error,
            StreamEvent::Retry(_) => EventKind::Retry,
        }
    }
}
