//! Transport that replays connection scripts

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rstream_client::{
    Metadata, MethodId, Notification, NotificationStream, StreamHandle, Transport,
    TransportError, TransportResult,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::scenario::ConnectionScript;

/// Serves the n-th open from the n-th script
pub struct ScriptedTransport {
    scripts: Vec<ConnectionScript>,
    opens: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<ConnectionScript>) -> Self {
        Self {
            scripts,
            opens: AtomicUsize::new(0),
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &self,
        method: &MethodId,
        request: &Bytes,
        metadata: &Metadata,
    ) -> TransportResult<Box<dyn StreamHandle>> {
        let index = self.opens.fetch_add(1, Ordering::SeqCst);
        info!(
            %method,
            connection = index,
            request_bytes = request.len(),
            metadata = ?metadata,
            "Opening scripted stream"
        );

        let script = self.scripts.get(index).cloned().unwrap_or_default();
        if let Some(reason) = script.fail {
            return Err(TransportError::ConnectionFailed(reason));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let feeder = tokio::spawn(async move {
            for step in &script.steps {
                if step.after_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(step.after_ms)).await;
                }
                let notification = step.emit.to_notification();
                let terminal = notification.is_terminal();
                if tx.send(notification).is_err() || terminal {
                    return;
                }
            }
            // unscripted tail: keep the stream open until cancelled
            debug!(connection = index, "Script finished, holding stream open");
            std::future::pending::<()>().await;
        });

        Ok(Box::new(ScriptedHandle {
            rx: Some(rx),
            feeder,
        }))
    }
}

struct ScriptedHandle {
    rx: Option<mpsc::UnboundedReceiver<Notification>>,
    feeder: JoinHandle<()>,
}

impl StreamHandle for ScriptedHandle {
    fn notifications(&mut self) -> Option<NotificationStream> {
        self.rx
            .take()
            .map(|rx| UnboundedReceiverStream::new(rx).boxed())
    }

    fn cancel(&mut self) {
        self.feeder.abort();
    }
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        self.feeder.abort();
    }
}
