//! Diagnostic reporting for stream lifecycle decisions
//!
//! The controller never prints. Every reconnect decision is handed to a
//! [`DiagnosticSink`] as a [`Diagnostic`]; the default [`TracingSink`] turns
//! them into `tracing` events.

use std::time::Duration;

use rstream_core::{EventKind, MethodId, RpcStatus};
use tracing::{debug, info, warn};

/// Why a reconnect was not scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    /// No backoff policy configured
    NoBackoff,
    /// The backoff policy returned no further interval
    BackoffExhausted,
    /// `max_retries` consecutive reconnects were made without data
    MaxRetries(u32),
}

/// A structured lifecycle event reported by the controller
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// A reconnect timer was armed
    ReconnectScheduled {
        method: MethodId,
        /// Retry counter at scheduling time (the attempt will be `retries + 1`)
        retries: u32,
        backoff: Duration,
    },
    /// Reconnection stopped; the subscription stays dormant
    ReconnectExpired {
        method: MethodId,
        retries: u32,
        reason: ExpiryReason,
    },
    /// A reconnect timer fired and a new stream is being opened
    Reconnecting { method: MethodId, retries: u32 },
    /// The current stream ended or failed
    StreamClosed {
        method: MethodId,
        kind: EventKind,
        status: Option<RpcStatus>,
    },
    /// A data message could not be decoded; it was dispatched raw
    DecodeFailed { method: MethodId, error: String },
}

impl Diagnostic {
    /// Stable kebab-case name
    pub fn name(&self) -> &'static str {
        match self {
            Diagnostic::ReconnectScheduled { .. } => "reconnect-scheduled",
            Diagnostic::ReconnectExpired { .. } => "reconnect-expired",
            Diagnostic::Reconnecting { .. } => "reconnecting",
            Diagnostic::StreamClosed { .. } => "stream-closed",
            Diagnostic::DecodeFailed { .. } => "decode-failed",
        }
    }
}

/// Receiver for controller diagnostics
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, diagnostic: &Diagnostic);
}

/// Sink that logs through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, diagnostic: &Diagnostic) {
        match diagnostic {
            Diagnostic::ReconnectScheduled {
                method,
                retries,
                backoff,
            } => {
                info!(
                    %method,
                    retries,
                    backoff_ms = backoff.as_millis() as u64,
                    "Reconnect scheduled"
                );
            }
            Diagnostic::ReconnectExpired {
                method,
                retries,
                reason,
            } => {
                warn!(%method, retries, ?reason, "Reconnect expired, stream is dormant");
            }
            Diagnostic::Reconnecting { method, retries } => {
                info!(%method, retries, "Reconnecting");
            }
            Diagnostic::StreamClosed {
                method,
                kind,
                status,
            } => match status {
                Some(status) => warn!(%method, %kind, code = status.code, message = %status.message, "Stream closed"),
                None => debug!(%method, %kind, "Stream closed"),
            },
            Diagnostic::DecodeFailed { method, error } => {
                warn!(%method, %error, "Failed to decode data message, dispatching raw");
            }
        }
    }
}
