//! Reconnecting stream controller
//!
//! [`StreamController`] owns one transport stream at a time, classifies its
//! notifications, dispatches them to listeners, and re-opens the stream after
//! it ends or fails.
//!
//! # Lifecycle
//!
//! ```text
//!   Idle ──connect()──▶ Connecting ──metadata/data──▶ Connected
//!                           │                            │
//!                           └──────────end/error─────────┤
//!                                                        ▼
//!                                               Ended | Failed
//!                                                        │
//!                                     retry enabled and backoff available
//!                                                        ▼
//!                                  Reconnecting ──timer──▶ Connecting …
//! ```
//!
//! With no backoff policy, an exhausted policy, or `max_retries` reached,
//! the controller stays in `Ended`/`Failed` and reports `reconnect-expired`.
//!
//! # Concurrency
//!
//! Notifications of the current stream are handled one at a time by a pump
//! task. Listeners run synchronously inside dispatch with no controller lock
//! held, so they may register/remove listeners or read state. The pump and
//! reconnect timer only hold weak references: dropping the last controller
//! handle cancels the stream and any pending reconnect.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::{Mutex, ReentrantMutex};
use rstream_core::{
    BackoffPolicy, DataPayload, EventKind, Metadata, MethodId, Notification, NotificationStream,
    RetryEvent, RpcStatus, StreamEvent, StreamHandle, Transport,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::StreamOptions;
use crate::decode::MessageDecoder;
use crate::diagnostics::{Diagnostic, DiagnosticSink, ExpiryReason};
use crate::error::{Result, StreamControllerError};
use crate::listeners::{Listener, ListenerId, ListenerOptions, ListenerRegistry};

/// Where the controller is in its connect/fail/reconnect cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// `connect()` has never been called
    Idle,
    /// A stream is being opened, or is open but has not delivered anything yet
    Connecting,
    /// The current stream delivered metadata or data
    Connected,
    /// The current stream failed
    Failed,
    /// The current stream ended
    Ended,
    /// A reconnect timer is pending or firing
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Ended => "ended",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Snapshot of the current stream handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// Unique per opened stream
    pub id: Uuid,
    /// Incremented by every `connect()`
    pub generation: u64,
    pub method: MethodId,
    pub opened_at: DateTime<Utc>,
}

/// Everything a controller is built from
pub(crate) struct ControllerParts {
    pub transport: Arc<dyn Transport>,
    pub method: MethodId,
    pub request: Bytes,
    pub metadata: Option<Metadata>,
    pub backoff: Option<Arc<dyn BackoffPolicy>>,
    pub options: StreamOptions,
    pub decoder: MessageDecoder,
    pub diagnostics: Arc<dyn DiagnosticSink>,
}

/// A server-streaming call that reconnects itself
///
/// Cheap to clone; all clones drive the same stream. Build one with
/// [`StreamBuilder`](crate::StreamBuilder).
#[derive(Clone)]
pub struct StreamController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    transport: Arc<dyn Transport>,
    method: MethodId,
    request: Bytes,
    options: StreamOptions,
    backoff: Option<Arc<dyn BackoffPolicy>>,
    decoder: MessageDecoder,
    diagnostics: Arc<dyn DiagnosticSink>,
    state: Mutex<ControllerState>,
    listeners: Mutex<ListenerRegistry>,
    /// Serializes dispatch across threads; re-entrant so listeners can
    /// dispatch inline
    dispatch_gate: ReentrantMutex<()>,
}

struct ControllerState {
    metadata: Option<Metadata>,
    retries: u32,
    phase: ConnectionState,
    generation: u64,
    active: Option<ActiveStream>,
    pending_reconnect: Option<PendingReconnect>,
    next_timer_id: u64,
}

struct ActiveStream {
    info: ConnectionInfo,
    handle: Box<dyn StreamHandle>,
    pump: JoinHandle<()>,
}

impl ActiveStream {
    /// Detach the pump first so nothing from the old stream is delivered
    /// after cancellation.
    fn teardown(mut self) {
        self.pump.abort();
        self.handle.cancel();
        debug!(
            stream_id = %self.info.id,
            generation = self.info.generation,
            "Stream torn down"
        );
    }
}

struct PendingReconnect {
    id: u64,
    task: JoinHandle<()>,
}

impl StreamController {
    pub(crate) fn from_parts(parts: ControllerParts) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                transport: parts.transport,
                method: parts.method,
                request: parts.request,
                options: parts.options,
                backoff: parts.backoff,
                decoder: parts.decoder,
                diagnostics: parts.diagnostics,
                state: Mutex::new(ControllerState {
                    metadata: parts.metadata,
                    retries: 0,
                    phase: ConnectionState::Idle,
                    generation: 0,
                    active: None,
                    pending_reconnect: None,
                    next_timer_id: 0,
                }),
                listeners: Mutex::new(ListenerRegistry::default()),
                dispatch_gate: ReentrantMutex::new(()),
            }),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn method(&self) -> &MethodId {
        &self.inner.method
    }

    pub fn request(&self) -> &Bytes {
        &self.inner.request
    }

    pub fn options(&self) -> StreamOptions {
        self.inner.options
    }

    /// Merged metadata used for the next `connect()`
    pub fn metadata(&self) -> Option<Metadata> {
        self.inner.state.lock().metadata.clone()
    }

    /// Merge `metadata` into the current metadata; newer keys win
    ///
    /// Takes effect on the next (re)connect.
    pub fn set_metadata(&self, metadata: Metadata) {
        let mut state = self.inner.state.lock();
        match state.metadata.as_mut() {
            Some(current) => current.merge(&metadata),
            None => state.metadata = Some(metadata),
        }
    }

    /// Reconnects made since the last data message
    pub fn retries(&self) -> u32 {
        self.inner.state.lock().retries
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().phase
    }

    /// The current stream handle
    ///
    /// Fails with [`StreamControllerError::NotConnected`] until a `connect()`
    /// has opened a stream.
    pub fn connection(&self) -> Result<ConnectionInfo> {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .map(|active| active.info.clone())
            .ok_or(StreamControllerError::NotConnected)
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.inner.state.lock().pending_reconnect.is_some()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.listeners.lock().len(kind)
    }

    // =========================================================================
    // Listener registration
    // =========================================================================

    /// Append a listener for `listener.kind()`
    ///
    /// The same listener may be registered more than once; it then runs once
    /// per registration.
    pub fn add_event_listener(
        &self,
        listener: Listener,
        options: Option<ListenerOptions>,
    ) -> ListenerId {
        self.inner.listeners.lock().add(listener, options)
    }

    /// Remove registrations of `listener` made with the same `options`
    ///
    /// Returns how many registrations were removed.
    pub fn remove_event_listener(
        &self,
        listener: &Listener,
        options: Option<ListenerOptions>,
    ) -> usize {
        self.inner.listeners.lock().remove(listener, options)
    }

    /// Remove a single registration
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.lock().remove_id(id)
    }

    /// Deliver `event` to its listeners synchronously, in registration order
    ///
    /// Only listeners registered when the call starts are invoked. A `once`
    /// registration is removed just before it runs, so a nested dispatch
    /// from an earlier listener cannot run it a second time. Retry state is
    /// not touched.
    pub fn dispatch_event(&self, event: StreamEvent) {
        let kind = event.kind();
        let _gate = self.inner.dispatch_gate.lock();
        let entries = self.inner.listeners.lock().snapshot(kind);
        trace!(%kind, listeners = entries.len(), "Dispatching event");

        for entry in &entries {
            if entry.once && !self.inner.listeners.lock().claim(kind, entry.id) {
                continue;
            }
            entry.listener.invoke(self, &event);
        }
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Open a fresh stream, replacing the current one
    ///
    /// Cancels a pending reconnect, tears down the current handle, then opens
    /// the method with the current metadata. An open failure is handled like
    /// an `error` notification.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime.
    pub async fn connect(&self) {
        let (generation, metadata) = {
            let mut state = self.inner.state.lock();
            if let Some(pending) = state.pending_reconnect.take() {
                pending.task.abort();
                debug!(method = %self.inner.method, "Pending reconnect cancelled");
            }
            if let Some(active) = state.active.take() {
                active.teardown();
            }
            state.generation += 1;
            state.phase = ConnectionState::Connecting;
            (state.generation, state.metadata.clone().unwrap_or_default())
        };

        debug!(method = %self.inner.method, generation, "Opening stream");
        let opened = self
            .inner
            .transport
            .open(&self.inner.method, &self.inner.request, &metadata)
            .await;

        let mut handle = match opened {
            Ok(handle) => handle,
            Err(err) => {
                warn!(method = %self.inner.method, generation, error = %err, "Failed to open stream");
                self.handle_notification(generation, Notification::Error(RpcStatus::from(&err)));
                return;
            }
        };

        let mut state = self.inner.state.lock();
        if state.generation != generation {
            // a later connect() started while this one was opening
            debug!(generation, current = state.generation, "Discarding superseded stream");
            handle.cancel();
            return;
        }

        let Some(notifications) = handle.notifications() else {
            drop(state);
            handle.cancel();
            warn!(method = %self.inner.method, generation, "Stream handle has no notification stream");
            self.handle_notification(
                generation,
                Notification::Error(RpcStatus::internal("notification stream already taken")),
            );
            return;
        };

        let info = ConnectionInfo {
            id: Uuid::new_v4(),
            generation,
            method: self.inner.method.clone(),
            opened_at: Utc::now(),
        };
        info!(method = %info.method, stream_id = %info.id, generation, "Stream opened");

        let pump = spawn_pump(Arc::downgrade(&self.inner), generation, notifications);
        state.active = Some(ActiveStream { info, handle, pump });
    }

    /// Schedule a reconnect using the backoff policy
    ///
    /// Without a policy (or when it is exhausted, or `max_retries` is
    /// reached) this reports `reconnect-expired` and does nothing else.
    /// While a reconnect is already pending the call is a no-op.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime.
    pub fn reconnect(&self) {
        let generation = self.inner.state.lock().generation;
        self.reconnect_for(generation);
    }

    /// Schedule a reconnect on behalf of the stream opened by `generation`
    fn reconnect_for(&self, generation: u64) {
        let method = self.inner.method.clone();
        let mut state = self.inner.state.lock();

        if state.generation != generation {
            // connect() ran since this stream closed
            debug!(%method, generation, current = state.generation, "Skipping reconnect for superseded stream");
            return;
        }
        if state.pending_reconnect.is_some() {
            debug!(%method, "Reconnect already pending");
            return;
        }

        let retries = state.retries;
        let expired = |reason| Diagnostic::ReconnectExpired {
            method: method.clone(),
            retries,
            reason,
        };

        let Some(backoff) = self.inner.backoff.as_ref() else {
            drop(state);
            self.report(expired(ExpiryReason::NoBackoff));
            return;
        };

        if let Some(max) = self.inner.options.max_retries {
            if retries >= max {
                drop(state);
                self.report(expired(ExpiryReason::MaxRetries(max)));
                return;
            }
        }

        let Some(interval) = backoff.next() else {
            drop(state);
            self.report(expired(ExpiryReason::BackoffExhausted));
            return;
        };

        state.next_timer_id += 1;
        let timer_id = state.next_timer_id;
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(inner) = weak.upgrade() {
                StreamController { inner }
                    .fire_reconnect(timer_id, interval)
                    .await;
            }
        });
        state.pending_reconnect = Some(PendingReconnect { id: timer_id, task });
        state.phase = ConnectionState::Reconnecting;
        drop(state);

        self.report(Diagnostic::ReconnectScheduled {
            method,
            retries,
            backoff: interval,
        });
    }

    async fn fire_reconnect(&self, timer_id: u64, interval: Duration) {
        let retries = {
            let mut state = self.inner.state.lock();
            match &state.pending_reconnect {
                Some(pending) if pending.id == timer_id => {}
                _ => return,
            }
            // dropping our own JoinHandle detaches, it does not abort
            state.pending_reconnect = None;
            state.retries = state.retries.saturating_add(1);
            state.retries
        };

        self.report(Diagnostic::Reconnecting {
            method: self.inner.method.clone(),
            retries,
        });

        // the failed handle is still current while retry listeners run
        self.dispatch_event(StreamEvent::Retry(RetryEvent {
            retries,
            backoff_millis: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        }));

        self.connect().await;
    }

    // =========================================================================
    // Classification
    // =========================================================================

    fn handle_notification(&self, generation: u64, notification: Notification) {
        if self.inner.state.lock().generation != generation {
            trace!(generation, kind = %notification.kind(), "Ignoring notification from superseded stream");
            return;
        }

        let event = match notification {
            Notification::Metadata(metadata) => StreamEvent::Metadata(metadata),
            Notification::Data(bytes) => StreamEvent::Data(self.decode(bytes)),
            Notification::End => StreamEvent::End,
            Notification::Error(status) => StreamEvent::Error(status),
        };
        self.handle_event(generation, event);
    }

    /// Apply `event` from the stream opened by `generation`, then dispatch it
    ///
    /// State changes and the superseded check happen under one lock, so a
    /// concurrent `connect()` either wins and the event is dropped, or loses
    /// and sees the updated phase.
    fn handle_event(&self, generation: u64, event: StreamEvent) {
        {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                trace!(generation, kind = %event.kind(), "Ignoring event from superseded stream");
                return;
            }
            match &event {
                StreamEvent::Data(_) => {
                    state.retries = 0;
                    state.phase = ConnectionState::Connected;
                }
                StreamEvent::Metadata(_) => state.phase = ConnectionState::Connected,
                StreamEvent::End => state.phase = ConnectionState::Ended,
                StreamEvent::Error(_) => state.phase = ConnectionState::Failed,
                StreamEvent::Retry(_) => {}
            }
        }

        match &event {
            StreamEvent::Data(_) => {
                if let Some(backoff) = &self.inner.backoff {
                    backoff.reset();
                }
            }
            StreamEvent::End | StreamEvent::Error(_) => {
                let status = match &event {
                    StreamEvent::Error(status) => Some(status.clone()),
                    _ => None,
                };
                self.report(Diagnostic::StreamClosed {
                    method: self.inner.method.clone(),
                    kind: event.kind(),
                    status,
                });
                if self.inner.options.retry {
                    self.reconnect_for(generation);
                }
            }
            StreamEvent::Metadata(_) | StreamEvent::Retry(_) => {}
        }

        self.dispatch_event(event);
    }

    fn decode(&self, bytes: Bytes) -> DataPayload {
        if !self.inner.options.is_object {
            return DataPayload::Raw(bytes);
        }
        match (self.inner.decoder)(&bytes) {
            Ok(value) => DataPayload::Structured(value),
            Err(err) => {
                self.report(Diagnostic::DecodeFailed {
                    method: self.inner.method.clone(),
                    error: err.to_string(),
                });
                DataPayload::Raw(bytes)
            }
        }
    }

    fn report(&self, diagnostic: Diagnostic) {
        self.inner.diagnostics.record(&diagnostic);
    }
}

impl fmt::Debug for StreamController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("StreamController")
            .field("method", &self.inner.method)
            .field("state", &state.phase)
            .field("retries", &state.retries)
            .field("generation", &state.generation)
            .field("options", &self.inner.options)
            .finish()
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(pending) = state.pending_reconnect.take() {
            pending.task.abort();
        }
        if let Some(active) = state.active.take() {
            active.teardown();
        }
    }
}

/// Route the notifications of one stream into the controller
///
/// Stops after the first end/error. A stream that finishes without either is
/// treated as ended.
fn spawn_pump(
    inner: Weak<ControllerInner>,
    generation: u64,
    mut notifications: NotificationStream,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = notifications.next().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let terminal = notification.is_terminal();
            StreamController { inner }.handle_notification(generation, notification);
            if terminal {
                return;
            }
        }

        if let Some(inner) = inner.upgrade() {
            debug!(generation, "Notification stream finished without end");
            StreamController { inner }.handle_notification(generation, Notification::End);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::StreamBuilder;
    use crate::testing::{wait_until, EventLog, MockTransport, RecordingSink, ScriptedBackoff};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(60);

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn error() -> Notification {
        Notification::Error(RpcStatus::unavailable("backend restarting"))
    }

    fn data(json: &'static str) -> Notification {
        Notification::Data(Bytes::from_static(json.as_bytes()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_before_connect_is_precondition_violation() {
        let transport = MockTransport::new();
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M").build();

        assert_eq!(controller.state(), ConnectionState::Idle);
        assert!(matches!(
            controller.connection(),
            Err(StreamControllerError::NotConnected)
        ));
        assert_eq!(transport.open_count(), 0);

        controller.connect().await;
        let info = controller.connection().unwrap();
        assert_eq!(info.generation, 1);
        assert_eq!(info.method.as_str(), "/t.S/M");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_replaces_and_cancels_previous_handle() {
        let transport = MockTransport::new();
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M").build();

        controller.connect().await;
        controller.connect().await;

        assert_eq!(transport.open_count(), 2);
        assert!(transport.is_cancelled(0));
        assert!(!transport.is_cancelled(1));
        assert_eq!(controller.connection().unwrap().generation, 2);

        // the old stream can no longer reach listeners
        let log = EventLog::attach(&controller);
        assert!(!transport.emit(0, data("{}")));
        tokio::time::sleep(ms(5)).await;
        assert!(log.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_errors_follow_backoff_script() {
        let transport = MockTransport::new();
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M")
            .with_options(StreamOptions::retrying())
            .with_backoff(Arc::new(ScriptedBackoff::from_millis([100, 200, 400])))
            .build();
        let log = EventLog::attach(&controller);

        controller.connect().await;
        for attempt in 1..=3usize {
            let failed_at = tokio::time::Instant::now();
            assert!(transport.emit_latest(error()));
            assert!(wait_until(|| transport.open_count() == attempt + 1, WAIT).await);

            let reopened = transport.calls()[attempt].opened_at;
            let expected = ms(100 << (attempt - 1));
            assert!(reopened - failed_at >= expected, "attempt {attempt} reopened too early");
            assert_eq!(controller.retries(), attempt as u32);
        }

        assert_eq!(
            log.retries(),
            vec![
                RetryEvent { retries: 1, backoff_millis: 100 },
                RetryEvent { retries: 2, backoff_millis: 200 },
                RetryEvent { retries: 3, backoff_millis: 400 },
            ]
        );
        assert_eq!(
            log.kinds(),
            vec![
                EventKind::Error,
                EventKind::Retry,
                EventKind::Error,
                EventKind::Retry,
                EventKind::Error,
                EventKind::Retry,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_backoff_leaves_stream_dormant() {
        let transport = MockTransport::new();
        let sink = Arc::new(RecordingSink::default());
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M")
            .with_options(StreamOptions::retrying())
            .with_diagnostics(sink.clone())
            .build();
        let log = EventLog::attach(&controller);

        controller.connect().await;
        transport.emit_latest(error());
        assert!(wait_until(|| !log.events().is_empty(), WAIT).await);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(log.kinds(), vec![EventKind::Error]);
        assert_eq!(transport.open_count(), 1);
        assert_eq!(controller.state(), ConnectionState::Failed);
        assert!(!controller.has_pending_reconnect());
        assert_eq!(sink.names(), vec!["stream-closed", "reconnect-expired"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_disabled_dispatches_without_reconnect() {
        let transport = MockTransport::new();
        let backoff = Arc::new(ScriptedBackoff::from_millis([10]));
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M")
            .with_backoff(backoff.clone())
            .build();
        let log = EventLog::attach(&controller);

        controller.connect().await;
        transport.emit_latest(Notification::End);
        assert!(wait_until(|| !log.events().is_empty(), WAIT).await);
        tokio::time::sleep(ms(100)).await;

        assert_eq!(log.kinds(), vec![EventKind::End]);
        assert_eq!(controller.state(), ConnectionState::Ended);
        assert_eq!(transport.open_count(), 1);
        assert_eq!(backoff.next_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_error_data_counter_sequence() {
        let transport = MockTransport::new();
        let backoff = Arc::new(ScriptedBackoff::from_millis([50, 50]));
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M")
            .with_options(StreamOptions::retrying())
            .with_backoff(backoff.clone())
            .build();
        let log = EventLog::attach(&controller);

        controller.connect().await;
        transport.emit_latest(data("{}"));
        assert!(wait_until(|| log.events().len() == 1, WAIT).await);
        assert_eq!(controller.retries(), 0);
        assert_eq!(controller.state(), ConnectionState::Connected);

        transport.emit_latest(error());
        assert!(wait_until(|| transport.open_count() == 2, WAIT).await);
        assert_eq!(controller.retries(), 1);

        transport.emit_latest(data("{}"));
        assert!(wait_until(|| controller.retries() == 0, WAIT).await);
        assert_eq!(backoff.resets(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_cancels_pending_reconnect() {
        let transport = MockTransport::new();
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M")
            .with_options(StreamOptions::retrying())
            .with_backoff(Arc::new(ScriptedBackoff::from_millis([1_000])))
            .build();
        let log = EventLog::attach(&controller);

        controller.connect().await;
        transport.emit_latest(error());
        assert!(wait_until(|| controller.has_pending_reconnect(), WAIT).await);

        controller.connect().await;
        assert!(!controller.has_pending_reconnect());
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(transport.open_count(), 2);
        assert!(log.retries().is_empty());
        assert_eq!(controller.retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_takes_retry_path() {
        let transport = MockTransport::new();
        transport.fail_next_open(rstream_core::TransportError::ConnectionFailed(
            "connection refused".into(),
        ));
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M")
            .with_options(StreamOptions::retrying())
            .with_backoff(Arc::new(ScriptedBackoff::from_millis([20])))
            .build();
        let log = EventLog::attach(&controller);

        controller.connect().await;
        assert!(controller.connection().is_err());
        assert!(wait_until(|| transport.stream_count() == 1, WAIT).await);

        let events = log.events();
        assert!(matches!(&events[0], StreamEvent::Error(status) if status.message.contains("connection refused")));
        assert_eq!(log.retries(), vec![RetryEvent { retries: 1, backoff_millis: 20 }]);
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_stream_counts_as_end() {
        let transport = MockTransport::new();
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M").build();
        let log = EventLog::attach(&controller);

        controller.connect().await;
        transport.finish(0);
        assert!(wait_until(|| !log.events().is_empty(), WAIT).await);
        assert_eq!(log.kinds(), vec![EventKind::End]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_listener_sees_failed_handle_as_current() {
        let transport = MockTransport::new();
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M")
            .with_options(StreamOptions::retrying())
            .with_backoff(Arc::new(ScriptedBackoff::from_millis([10])))
            .build();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_listener = seen.clone();
        controller.add_event_listener(
            Listener::retry(move |controller, _| {
                let generation = controller.connection().map(|info| info.generation).ok();
                seen_in_listener.lock().push(generation);
            }),
            None,
        );

        controller.connect().await;
        transport.emit_latest(error());
        assert!(wait_until(|| transport.open_count() == 2, WAIT).await);
        assert_eq!(*seen.lock(), vec![Some(1)]);
        assert_eq!(controller.connection().unwrap().generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_listener_fires_once() {
        let transport = MockTransport::new();
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M").build();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        controller.add_event_listener(
            Listener::data(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Some(ListenerOptions::once()),
        );

        for _ in 0..3 {
            controller.dispatch_event(StreamEvent::Data(DataPayload::Raw(Bytes::new())));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.listener_count(EventKind::Data), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_listener_survives_nested_dispatch() {
        let transport = MockTransport::new();
        let controller = StreamBuilder::new(transport, "/t.S/M").build();
        let calls = Arc::new(AtomicUsize::new(0));
        let nested = Arc::new(std::sync::atomic::AtomicBool::new(false));

        // runs first and re-dispatches the same event inline
        controller.add_event_listener(
            Listener::end(move |controller| {
                if !nested.swap(true, Ordering::SeqCst) {
                    controller.dispatch_event(StreamEvent::End);
                }
            }),
            None,
        );
        let counter = calls.clone();
        controller.add_event_listener(
            Listener::end(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Some(ListenerOptions::once()),
        );

        controller.dispatch_event(StreamEvent::End);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.listener_count(EventKind::End), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_added_during_dispatch_runs_next_time() {
        let transport = MockTransport::new();
        let controller = StreamBuilder::new(transport, "/t.S/M").build();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        controller.add_event_listener(
            Listener::end(move |controller| {
                let counter = counter.clone();
                controller.add_event_listener(
                    Listener::end(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                    None,
                );
            }),
            Some(ListenerOptions::once()),
        );

        controller.dispatch_event(StreamEvent::End);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        controller.dispatch_event(StreamEvent::End);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_merge() {
        let transport = MockTransport::new();
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M").build();
        assert_eq!(controller.metadata(), None);

        controller.set_metadata(Metadata::new().with("a", "1"));
        controller.set_metadata(Metadata::new().with("b", "2"));
        assert_eq!(
            controller.metadata(),
            Some(Metadata::from_iter([("a", "1"), ("b", "2")]))
        );
        controller.set_metadata(Metadata::new().with("a", "3"));

        controller.connect().await;
        assert_eq!(
            transport.calls()[0].metadata,
            Metadata::from_iter([("a", "3"), ("b", "2")])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_controller_cancels_stream_and_timer() {
        let transport = MockTransport::new();
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M")
            .with_options(StreamOptions::retrying())
            .with_backoff(Arc::new(ScriptedBackoff::from_millis([100])))
            .build();

        controller.connect().await;
        transport.emit_latest(error());
        assert!(wait_until(|| controller.has_pending_reconnect(), WAIT).await);

        drop(controller);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(transport.is_cancelled(0));
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_from_superseded_stream_is_ignored() {
        let transport = MockTransport::new();
        let backoff = Arc::new(ScriptedBackoff::from_millis([10]));
        let sink = Arc::new(RecordingSink::default());
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M")
            .with_options(StreamOptions::retrying())
            .with_backoff(backoff.clone())
            .with_diagnostics(sink.clone())
            .build();
        let log = EventLog::attach(&controller);

        controller.connect().await;
        controller.connect().await;

        // an error from generation 1 arriving after the second connect
        controller.handle_event(1, StreamEvent::Error(RpcStatus::unavailable("late")));
        tokio::time::sleep(ms(100)).await;

        assert!(log.events().is_empty());
        assert!(sink.names().is_empty());
        assert_eq!(controller.state(), ConnectionState::Connecting);
        assert_eq!(backoff.next_calls(), 0);
        assert_eq!(transport.open_count(), 2);
        assert!(!transport.is_cancelled(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_for_superseded_stream_schedules_nothing() {
        let transport = MockTransport::new();
        let backoff = Arc::new(ScriptedBackoff::from_millis([10]));
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M")
            .with_options(StreamOptions::retrying())
            .with_backoff(backoff.clone())
            .build();

        controller.connect().await;
        controller.connect().await;

        // the close of generation 1 was reported, then connect() won the race
        controller.reconnect_for(1);
        assert!(!controller.has_pending_reconnect());
        tokio::time::sleep(ms(100)).await;

        assert_eq!(backoff.next_calls(), 0);
        assert_eq!(controller.retries(), 0);
        assert_eq!(transport.open_count(), 2);
        assert!(!transport.is_cancelled(1));
    }
}
