//! Fluent construction of stream controllers

use std::sync::Arc;

use bytes::Bytes;
use rstream_core::{
    BackoffPolicy, DataPayload, Metadata, MethodId, RetryEvent, RpcStatus, Transport,
};

use crate::config::{ClientConfig, StreamOptions};
use crate::controller::{ControllerParts, StreamController};
use crate::decode::{json_decoder, MessageDecoder};
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::listeners::{Listener, ListenerOptions};

/// Builder for [`StreamController`]
///
/// # Example
///
/// ```ignore
/// let controller = StreamBuilder::new(transport, "/market.Ticker/Subscribe")
///     .with_options(StreamOptions::retrying().with_is_object(true))
///     .with_backoff(Arc::new(ExponentialBackoff::default()))
///     .on_data(|_, payload| println!("{payload:?}"), None)
///     .start()
///     .await;
/// ```
pub struct StreamBuilder {
    transport: Arc<dyn Transport>,
    method: MethodId,
    request: Bytes,
    metadata: Option<Metadata>,
    backoff: Option<Arc<dyn BackoffPolicy>>,
    options: StreamOptions,
    decoder: Option<MessageDecoder>,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
    listeners: Vec<(Listener, Option<ListenerOptions>)>,
}

impl StreamBuilder {
    /// Start a builder with an empty request and default options
    pub fn new(transport: Arc<dyn Transport>, method: impl Into<MethodId>) -> Self {
        Self {
            transport,
            method: method.into(),
            request: Bytes::new(),
            metadata: None,
            backoff: None,
            options: StreamOptions::default(),
            decoder: None,
            diagnostics: None,
            listeners: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: impl Into<MethodId>) -> Self {
        self.method = method.into();
        self
    }

    /// Encoded request message sent on every (re)connect
    pub fn with_request(mut self, request: impl Into<Bytes>) -> Self {
        self.request = request.into();
        self
    }

    /// Merge into the initial metadata
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(match self.metadata.take() {
            Some(current) => current.merged(&metadata),
            None => metadata,
        });
        self
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Decoder used when `is_object` is set; JSON by default
    pub fn with_decoder(mut self, decoder: MessageDecoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Where lifecycle diagnostics go; `tracing` by default
    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    /// Apply options, backoff and metadata from a loaded config
    pub fn with_config(mut self, config: &ClientConfig) -> Self {
        self.options = config.stream;
        if let Some(backoff) = &config.backoff {
            self.backoff = Some(backoff.build());
        }
        if !config.metadata.is_empty() {
            self = self.with_metadata(config.metadata.clone());
        }
        self
    }

    pub fn listener(mut self, listener: Listener, options: Option<ListenerOptions>) -> Self {
        self.listeners.push((listener, options));
        self
    }

    pub fn on_metadata<F>(self, f: F, options: Option<ListenerOptions>) -> Self
    where
        F: Fn(&StreamController, &Metadata) + Send + Sync + 'static,
    {
        self.listener(Listener::metadata(f), options)
    }

    pub fn on_data<F>(self, f: F, options: Option<ListenerOptions>) -> Self
    where
        F: Fn(&StreamController, &DataPayload) + Send + Sync + 'static,
    {
        self.listener(Listener::data(f), options)
    }

    pub fn on_end<F>(self, f: F, options: Option<ListenerOptions>) -> Self
    where
        F: Fn(&StreamController) + Send + Sync + 'static,
    {
        self.listener(Listener::end(f), options)
    }

    pub fn on_error<F>(self, f: F, options: Option<ListenerOptions>) -> Self
    where
        F: Fn(&StreamController, &RpcStatus) + Send + Sync + 'static,
    {
        self.listener(Listener::error(f), options)
    }

    pub fn on_retry<F>(self, f: F, options: Option<ListenerOptions>) -> Self
    where
        F: Fn(&StreamController, &RetryEvent) + Send + Sync + 'static,
    {
        self.listener(Listener::retry(f), options)
    }

    /// Create the controller without connecting
    pub fn build(self) -> StreamController {
        let controller = StreamController::from_parts(ControllerParts {
            transport: self.transport,
            method: self.method,
            request: self.request,
            metadata: self.metadata,
            backoff: self.backoff,
            options: self.options,
            decoder: self.decoder.unwrap_or_else(json_decoder),
            diagnostics: self
                .diagnostics
                .unwrap_or_else(|| Arc::new(TracingSink)),
        });
        for (listener, options) in self.listeners {
            controller.add_event_listener(listener, options);
        }
        controller
    }

    /// Create the controller and open the first stream
    pub async fn start(self) -> StreamController {
        let controller = self.build();
        controller.connect().await;
        controller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use rstream_core::EventKind;

    #[test]
    fn test_build_registers_listeners_without_connecting() {
        let transport = MockTransport::new();
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M")
            .on_data(|_, _| {}, None)
            .on_data(|_, _| {}, Some(ListenerOptions::once()))
            .on_retry(|_, _| {}, None)
            .build();

        assert_eq!(controller.listener_count(EventKind::Data), 2);
        assert_eq!(controller.listener_count(EventKind::Retry), 1);
        assert_eq!(controller.listener_count(EventKind::Error), 0);
        assert_eq!(transport.open_count(), 0);
    }

    #[test]
    fn test_with_metadata_merges() {
        let transport = MockTransport::new();
        let controller = StreamBuilder::new(transport, "/t.S/M")
            .with_metadata(Metadata::new().with("a", "1").with("b", "1"))
            .with_metadata(Metadata::new().with("b", "2"))
            .build();
        assert_eq!(
            controller.metadata(),
            Some(Metadata::from_iter([("a", "1"), ("b", "2")]))
        );
    }

    #[test]
    fn test_with_config() {
        let config = ClientConfig::from_toml_str(
            r#"
            [stream]
            retry = true
            retries = 3

            [backoff]
            type = "constant"
            interval_ms = 500

            [metadata]
            x-client = "rstream"
            "#,
        )
        .unwrap();

        let controller = StreamBuilder::new(MockTransport::new(), "/t.S/M")
            .with_request(Bytes::from_static(b"req"))
            .with_config(&config)
            .build();

        assert_eq!(controller.options(), StreamOptions::retrying().with_max_retries(3));
        assert_eq!(controller.request().as_ref(), b"req");
        assert_eq!(
            controller.metadata().unwrap().get("x-client"),
            Some("rstream")
        );
    }

    #[tokio::test]
    async fn test_start_connects() {
        let transport = MockTransport::new();
        let controller = StreamBuilder::new(transport.clone(), "/t.S/M").start().await;
        assert_eq!(transport.open_count(), 1);
        assert!(controller.connection().is_ok());
    }
}
