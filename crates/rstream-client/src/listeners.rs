//! Typed listener registry
//!
//! Listeners are stored per [`EventKind`] in registration order. Each kind has
//! its own listener signature, so a data listener can never be handed an error
//! payload. Listener identity is the address of the shared closure: clone a
//! [`Listener`] to keep a handle that can later be passed to
//! `remove_event_listener`.

use std::fmt;
use std::sync::Arc;

use rstream_core::{DataPayload, EventKind, Metadata, RetryEvent, RpcStatus, StreamEvent};

use crate::controller::StreamController;

pub type MetadataListener = Arc<dyn Fn(&StreamController, &Metadata) + Send + Sync>;
pub type DataListener = Arc<dyn Fn(&StreamController, &DataPayload) + Send + Sync>;
pub type EndListener = Arc<dyn Fn(&StreamController) + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&StreamController, &RpcStatus) + Send + Sync>;
pub type RetryListener = Arc<dyn Fn(&StreamController, &RetryEvent) + Send + Sync>;

/// An observer for exactly one event kind
#[derive(Clone)]
pub enum Listener {
    Metadata(MetadataListener),
    Data(DataListener),
    End(EndListener),
    Error(ErrorListener),
    Retry(RetryListener),
}

impl Listener {
    pub fn metadata<F>(f: F) -> Self
    where
        F: Fn(&StreamController, &Metadata) + Send + Sync + 'static,
    {
        Listener::Metadata(Arc::new(f))
    }

    pub fn data<F>(f: F) -> Self
    where
        F: Fn(&StreamController, &DataPayload) + Send + Sync + 'static,
    {
        Listener::Data(Arc::new(f))
    }

    pub fn end<F>(f: F) -> Self
    where
        F: Fn(&StreamController) + Send + Sync + 'static,
    {
        Listener::End(Arc::new(f))
    }

    pub fn error<F>(f: F) -> Self
    where
        F: Fn(&StreamController, &RpcStatus) + Send + Sync + 'static,
    {
        Listener::Error(Arc::new(f))
    }

    pub fn retry<F>(f: F) -> Self
    where
        F: Fn(&StreamController, &RetryEvent) + Send + Sync + 'static,
    {
        Listener::Retry(Arc::new(f))
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Listener::Metadata(_) => EventKind::Metadata,
            Listener::Data(_) => EventKind::Data,
            Listener::End(_) => EventKind::End,
            Listener::Error(_) => EventKind::Error,
            Listener::Retry(_) => EventKind::Retry,
        }
    }

    /// True if both refer to the same closure
    pub fn same_as(&self, other: &Listener) -> bool {
        self.kind() == other.kind() && std::ptr::addr_eq(self.addr(), other.addr())
    }

    fn addr(&self) -> *const () {
        match self {
            Listener::Metadata(f) => Arc::as_ptr(f) as *const (),
            Listener::Data(f) => Arc::as_ptr(f) as *const (),
            Listener::End(f) => Arc::as_ptr(f) as *const (),
            Listener::Error(f) => Arc::as_ptr(f) as *const (),
            Listener::Retry(f) => Arc::as_ptr(f) as *const (),
        }
    }

    pub(crate) fn invoke(&self, controller: &StreamController, event: &StreamEvent) {
        match (self, event) {
            (Listener::Metadata(f), StreamEvent::Metadata(metadata)) => f(controller, metadata),
            (Listener::Data(f), StreamEvent::Data(payload)) => f(controller, payload),
            (Listener::End(f), StreamEvent::End) => f(controller),
            (Listener::Error(f), StreamEvent::Error(status)) => f(controller, status),
            (Listener::Retry(f), StreamEvent::Retry(retry)) => f(controller, retry),
            // registry slots are keyed by kind
            _ => {}
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener::{}({:p})", self.kind(), self.addr())
    }
}

/// Per-registration options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Remove the registration after its first invocation
    pub once: bool,
}

impl ListenerOptions {
    pub fn once() -> Self {
        Self { once: true }
    }
}

/// Identifies one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    listener: Listener,
    options: Option<ListenerOptions>,
}

impl Registration {
    fn is_once(&self) -> bool {
        self.options.is_some_and(|options| options.once)
    }
}

/// One listener scheduled to run in a dispatch pass
pub(crate) struct DispatchEntry {
    pub id: ListenerId,
    pub listener: Listener,
    pub once: bool,
}

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    slots: [Vec<Registration>; EventKind::COUNT],
    next_id: u64,
}

impl ListenerRegistry {
    pub fn add(&mut self, listener: Listener, options: Option<ListenerOptions>) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.slots[listener.kind().index()].push(Registration {
            id,
            listener,
            options,
        });
        id
    }

    /// Remove every registration of `listener` made with exactly `options`
    pub fn remove(&mut self, listener: &Listener, options: Option<ListenerOptions>) -> usize {
        let slot = &mut self.slots[listener.kind().index()];
        let before = slot.len();
        slot.retain(|reg| !(reg.listener.same_as(listener) && reg.options == options));
        before - slot.len()
    }

    pub fn remove_id(&mut self, id: ListenerId) -> bool {
        for slot in &mut self.slots {
            if let Some(pos) = slot.iter().position(|reg| reg.id == id) {
                slot.remove(pos);
                return true;
            }
        }
        false
    }

    /// Listeners for `kind` in dispatch order
    pub fn snapshot(&self, kind: EventKind) -> Vec<DispatchEntry> {
        self.slots[kind.index()]
            .iter()
            .map(|reg| DispatchEntry {
                id: reg.id,
                listener: reg.listener.clone(),
                once: reg.is_once(),
            })
            .collect()
    }

    /// Take a once-registration out before it runs
    ///
    /// Returns false when it is already gone, e.g. claimed by a nested
    /// dispatch or removed by another listener.
    pub fn claim(&mut self, kind: EventKind, id: ListenerId) -> bool {
        let slot = &mut self.slots[kind.index()];
        match slot.iter().position(|reg| reg.id == id) {
            Some(pos) => {
                slot.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn len(&self, kind: EventKind) -> usize {
        self.slots[kind.index()].len()
    }
}
