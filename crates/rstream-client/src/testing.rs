//! Test utilities for rstream-client
//!
//! In-memory transport, scripted backoff and recorders for exercising a
//! [`StreamController`] without a network.
//!
//! ```ignore
//! let transport = MockTransport::new();
//! let controller = StreamBuilder::new(transport.clone(), "/t.S/M").start().await;
//! let log = EventLog::attach(&controller);
//!
//! transport.emit_latest(Notification::End);
//! assert!(wait_until(|| !log.events().is_empty(), Duration::from_secs(1)).await);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use rstream_core::{
    BackoffPolicy, EventKind, Metadata, MethodId, Notification, NotificationStream, RetryEvent,
    StreamEvent, StreamHandle, Transport, TransportError, TransportResult,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::controller::StreamController;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::listeners::Listener;

/// Arguments of one `Transport::open` call
#[derive(Debug, Clone)]
pub struct OpenCall {
    pub method: MethodId,
    pub request: Bytes,
    pub metadata: Metadata,
    pub opened_at: tokio::time::Instant,
}

struct MockStream {
    tx: mpsc::UnboundedSender<Notification>,
    cancelled: Arc<AtomicBool>,
}

/// Transport whose streams are fed by the test
///
/// Streams are indexed in the order they were successfully opened.
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<OpenCall>>,
    streams: Mutex<Vec<MockStream>>,
    open_failures: Mutex<VecDeque<TransportError>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `open` fail with `error`
    pub fn fail_next_open(&self, error: TransportError) {
        self.open_failures.lock().push_back(error);
    }

    /// Number of `open` calls, failed ones included
    pub fn open_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<OpenCall> {
        self.calls.lock().clone()
    }

    /// Number of streams successfully opened
    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Push a notification into stream `index`
    ///
    /// Returns false if the stream does not exist, was cancelled, or its
    /// handle is gone.
    pub fn emit(&self, index: usize, notification: Notification) -> bool {
        let streams = self.streams.lock();
        let Some(stream) = streams.get(index) else {
            return false;
        };
        if stream.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        stream.tx.send(notification).is_ok()
    }

    /// Push a notification into the most recently opened stream
    pub fn emit_latest(&self, notification: Notification) -> bool {
        let latest = self.stream_count().checked_sub(1);
        latest.is_some_and(|index| self.emit(index, notification))
    }

    /// Close stream `index` without an end or error notification
    pub fn finish(&self, index: usize) {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get_mut(index) {
            let (closed, _) = mpsc::unbounded_channel();
            stream.tx = closed;
        }
    }

    pub fn is_cancelled(&self, index: usize) -> bool {
        self.streams
            .lock()
            .get(index)
            .is_some_and(|stream| stream.cancelled.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        method: &MethodId,
        request: &Bytes,
        metadata: &Metadata,
    ) -> TransportResult<Box<dyn StreamHandle>> {
        self.calls.lock().push(OpenCall {
            method: method.clone(),
            request: request.clone(),
            metadata: metadata.clone(),
            opened_at: tokio::time::Instant::now(),
        });

        if let Some(error) = self.open_failures.lock().pop_front() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        self.streams.lock().push(MockStream {
            tx,
            cancelled: cancelled.clone(),
        });

        Ok(Box::new(MockStreamHandle {
            rx: Some(rx),
            cancelled,
        }))
    }
}

struct MockStreamHandle {
    rx: Option<mpsc::UnboundedReceiver<Notification>>,
    cancelled: Arc<AtomicBool>,
}

impl StreamHandle for MockStreamHandle {
    fn notifications(&mut self) -> Option<NotificationStream> {
        self.rx
            .take()
            .map(|rx| UnboundedReceiverStream::new(rx).boxed())
    }

    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Backoff that hands out a fixed list of intervals
///
/// `reset` rewinds to the first interval.
#[derive(Debug, Default)]
pub struct ScriptedBackoff {
    intervals: Vec<Duration>,
    position: Mutex<usize>,
    next_calls: AtomicUsize,
    resets: AtomicUsize,
}

impl ScriptedBackoff {
    pub fn new(intervals: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            intervals: intervals.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn from_millis(intervals: impl IntoIterator<Item = u64>) -> Self {
        Self::new(intervals.into_iter().map(Duration::from_millis))
    }

    pub fn next_calls(&self) -> usize {
        self.next_calls.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl BackoffPolicy for ScriptedBackoff {
    fn next(&self) -> Option<Duration> {
        self.next_calls.fetch_add(1, Ordering::SeqCst);
        let mut position = self.position.lock();
        let interval = self.intervals.get(*position).copied()?;
        *position += 1;
        Some(interval)
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        *self.position.lock() = 0;
    }
}

/// Diagnostic sink that keeps everything it is given
#[derive(Debug, Default)]
pub struct RecordingSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl RecordingSink {
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.diagnostics.lock().iter().map(Diagnostic::name).collect()
    }
}

impl DiagnosticSink for RecordingSink {
    fn record(&self, diagnostic: &Diagnostic) {
        self.diagnostics.lock().push(diagnostic.clone());
    }
}

/// Every event a controller dispatched, in dispatch order
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<StreamEvent>>>,
}

impl EventLog {
    /// Register one listener per event kind on `controller`
    pub fn attach(controller: &StreamController) -> Self {
        let log = Self::default();
        for kind in EventKind::ALL {
            let events = log.events.clone();
            let listener = match kind {
                EventKind::Metadata => Listener::metadata(move |_, metadata| {
                    events.lock().push(StreamEvent::Metadata(metadata.clone()))
                }),
                EventKind::Data => Listener::data(move |_, payload| {
                    events.lock().push(StreamEvent::Data(payload.clone()))
                }),
                EventKind::End => Listener::end(move |_| events.lock().push(StreamEvent::End)),
                EventKind::Error => Listener::error(move |_, status| {
                    events.lock().push(StreamEvent::Error(status.clone()))
                }),
                EventKind::Retry => Listener::retry(move |_, retry| {
                    events.lock().push(StreamEvent::Retry(*retry))
                }),
            };
            controller.add_event_listener(listener, None);
        }
        log
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(StreamEvent::kind).collect()
    }

    pub fn retries(&self) -> Vec<RetryEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Retry(retry) => Some(*retry),
                _ => None,
            })
            .collect()
    }
}

/// Wait for a condition with timeout
///
/// Polls every 10ms of Tokio time, so it also works with paused time.
pub async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    condition()
}
