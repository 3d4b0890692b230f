//! Backend selection and event dispatch
//!
//! Picks exactly one capture backend per host from the advertised
//! capabilities and routes host events to it.

use futures_util::{FutureExt, Stream, StreamExt};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::capture::events::HostEvent;
use crate::capture::host::{ContextId, HostCapabilities};
use crate::capture::protocol::ProtocolCapture;
use crate::capture::webrequest::WebRequestCapture;
use crate::config::{BackendPreference, Config};
use crate::sink::EntrySink;
use crate::{Error, Result};

/// The active capture backend.
#[derive(Debug)]
pub enum Capture {
    Protocol(ProtocolCapture),
    WebRequest(WebRequestCapture),
}

impl Capture {
    /// Choose a backend. The debugger protocol is preferred when available,
    /// otherwise webRequest with streaming response filters. Returns `None`
    /// when the host offers neither (capture is unsupported there).
    pub fn select(caps: &HostCapabilities, sink: Arc<dyn EntrySink>, config: &Config) -> Result<Option<Self>> {
        let protocol = match config.backend {
            BackendPreference::Auto | BackendPreference::Protocol => caps.debugger.clone(),
            BackendPreference::WebRequest => None,
        };
        if let Some(debugger) = protocol {
            info!("Selected debugger protocol capture backend");
            return Ok(Some(Capture::Protocol(ProtocolCapture::new(debugger, sink, config)?)));
        }

        let web_request = match config.backend {
            BackendPreference::Auto | BackendPreference::WebRequest => caps
                .web_request
                .clone()
                .filter(|host| host.supports_response_filter()),
            BackendPreference::Protocol => None,
        };
        if let Some(host) = web_request {
            info!("Selected webRequest capture backend");
            return Ok(Some(Capture::WebRequest(WebRequestCapture::new(host, sink, config)?)));
        }

        warn!("No capture backend available for {:?} with preference {:?}", caps, config.backend);
        Ok(None)
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Capture::Protocol(_) => "protocol",
            Capture::WebRequest(_) => "webRequest",
        }
    }

    /// Start capturing a browsing context.
    pub async fn attach(&mut self, context_id: ContextId) -> bool {
        match self {
            Capture::Protocol(capture) => capture.attach(context_id).await,
            Capture::WebRequest(capture) => capture.attach(context_id),
        }
    }

    /// Stop all capture and drop in-flight state. Safe to call repeatedly.
    pub async fn detach_all(&mut self) {
        match self {
            Capture::Protocol(capture) => capture.detach_all().await,
            Capture::WebRequest(capture) => capture.detach_all(),
        }
    }

    /// Feed one host event to the active backend. Handler failures and
    /// panics are logged and never propagate back into the host's dispatch.
    pub async fn dispatch(&mut self, event: HostEvent) {
        let name = event.event_name().to_string();
        let result = match (self, event) {
            (Capture::Protocol(capture), HostEvent::Protocol(e)) => {
                AssertUnwindSafe(capture.handle_event(&e.source, e.event))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(handler_panic(panic)))
            }
            (Capture::WebRequest(capture), HostEvent::WebRequest(e)) => {
                catch_unwind(AssertUnwindSafe(|| capture.handle_event(e)))
                    .unwrap_or_else(|panic| Err(handler_panic(panic)))
            }
            (capture, _) => {
                debug!("Ignoring {} on the {} backend", name, capture.backend_name());
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("Error handling {}: {}", name, e);
        }
    }

    /// Pump events until the stream ends. Returns the number dispatched.
    pub async fn run<S>(&mut self, mut events: S) -> u64
    where
        S: Stream<Item = HostEvent> + Unpin,
    {
        let mut handled = 0;
        while let Some(event) = events.next().await {
            self.dispatch(event).await;
            handled += 1;
        }
        debug!("Event stream ended after {} events", handled);
        handled
    }

    pub fn pending_requests(&self) -> usize {
        match self {
            Capture::Protocol(capture) => capture.pending_requests(),
            Capture::WebRequest(capture) => capture.pending_requests(),
        }
    }

    pub fn emitted(&self) -> u64 {
        match self {
            Capture::Protocol(capture) => capture.emitted(),
            Capture::WebRequest(capture) => capture.emitted(),
        }
    }
}

fn handler_panic(panic: Box<dyn Any + Send>) -> Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Error::internal(format!("handler panicked: {}", message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::events::{DebuggerSource, WebRequestDetails, WebRequestEvent};
    use crate::capture::host::{ResponseFilter, WebRequestHost};
    use crate::replay::{ReplayDebugger, ReplayWebRequest};
    use crate::sink::ChannelSink;
    use serde_json::json;

    fn both() -> HostCapabilities {
        HostCapabilities {
            debugger: Some(Arc::new(ReplayDebugger::new())),
            web_request: Some(Arc::new(ReplayWebRequest::new(true))),
        }
    }

    #[test]
    fn test_prefers_protocol() {
        let (sink, _rx) = ChannelSink::new();
        let capture = Capture::select(&both(), Arc::new(sink), &Config::default()).unwrap().unwrap();
        assert_eq!(capture.backend_name(), "protocol");
    }

    #[test]
    fn test_preference_override() {
        let (sink, _rx) = ChannelSink::new();
        let config = Config {
            backend: BackendPreference::WebRequest,
            ..Config::default()
        };
        let capture = Capture::select(&both(), Arc::new(sink), &config).unwrap().unwrap();
        assert_eq!(capture.backend_name(), "webRequest");
    }

    #[test]
    fn test_webrequest_without_filter_is_unsupported() {
        let (sink, _rx) = ChannelSink::new();
        let caps = HostCapabilities::with_web_request(Arc::new(ReplayWebRequest::new(false)));
        assert!(Capture::select(&caps, Arc::new(sink), &Config::default()).unwrap().is_none());

        let (sink, _rx) = ChannelSink::new();
        assert!(Capture::select(&HostCapabilities::default(), Arc::new(sink), &Config::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_invalid_textual_pattern_is_error() {
        let (sink, _rx) = ChannelSink::new();
        let config = Config {
            textual_content_types: vec!["(".to_string()],
            ..Config::default()
        };
        assert!(Capture::select(&both(), Arc::new(sink), &config).is_err());
    }

    #[tokio::test]
    async fn test_run_pumps_stream() {
        let (sink, mut rx) = ChannelSink::new();
        let caps = HostCapabilities::with_web_request(Arc::new(ReplayWebRequest::new(true)));
        let mut capture = Capture::select(&caps, Arc::new(sink), &Config::default()).unwrap().unwrap();
        assert!(capture.attach(1).await);

        let mut failed = WebRequestDetails::new("1", "https://a.test/");
        failed.error = Some("NS_BINDING_ABORTED".to_string());
        let events = vec![
            HostEvent::from(WebRequestEvent::BeforeRequest(WebRequestDetails::new("1", "https://a.test/"))),
            HostEvent::protocol(DebuggerSource::tab(1), "Network.loadingFinished", json!({"requestId": "1"}))
                .unwrap(),
            HostEvent::from(WebRequestEvent::ErrorOccurred(failed)),
        ];

        let handled = capture.run(futures_util::stream::iter(events)).await;
        assert_eq!(handled, 3);
        assert_eq!(capture.emitted(), 1);
        let captured = rx.recv().await.unwrap();
        assert_eq!(captured.entry.network_error(), Some("NS_BINDING_ABORTED"));
    }

    struct PanickingFilterHost;

    impl WebRequestHost for PanickingFilterHost {
        fn supports_response_filter(&self) -> bool {
            true
        }

        fn add_listeners(&self) -> Result<()> {
            Ok(())
        }

        fn remove_listeners(&self) {}

        fn filter_response_data(&self, _request_id: &str) -> Result<Box<dyn ResponseFilter>> {
            panic!("filter host broke")
        }
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let (sink, mut rx) = ChannelSink::new();
        let caps = HostCapabilities::with_web_request(Arc::new(PanickingFilterHost));
        let mut capture = Capture::select(&caps, Arc::new(sink), &Config::default()).unwrap().unwrap();
        assert!(capture.attach(1).await);

        capture
            .dispatch(WebRequestEvent::BeforeRequest(WebRequestDetails::new("1", "https://a.test/")).into())
            .await;
        capture
            .dispatch(WebRequestEvent::HeadersReceived(WebRequestDetails::new("1", "https://a.test/")).into())
            .await;

        let mut failed = WebRequestDetails::new("2", "https://a.test/next");
        failed.error = Some("NS_ERROR_ABORT".to_string());
        capture
            .dispatch(WebRequestEvent::BeforeRequest(WebRequestDetails::new("2", "https://a.test/next")).into())
            .await;
        capture.dispatch(WebRequestEvent::ErrorOccurred(failed).into()).await;

        let captured = rx.recv().await.unwrap();
        assert_eq!(captured.entry.request.url, "https://a.test/next");
        assert_eq!(captured.entry.network_error(), Some("NS_ERROR_ABORT"));
    }

    #[test]
    fn test_handler_panic_message() {
        let err = handler_panic(Box::new("boom"));
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(err.to_string(), "Internal error: handler panicked: boom");
        let err = handler_panic(Box::new(String::from("owned")));
        assert_eq!(err.to_string(), "Internal error: handler panicked: owned");
    }
}
