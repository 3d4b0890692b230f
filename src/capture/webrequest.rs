//! webRequest-style capture backend (response filter hosts).
//!
//! Transactions are keyed by the webRequest request id in a single ledger.
//! Response bodies are streamed through a filter attached while handling
//! `onHeadersReceived`. The filter's stop callback is the primary emission
//! point. `onCompleted` finalizes whatever is still in the ledger with a
//! body-less entry and disconnects a filter that never stopped, so a stop or
//! filter error arriving afterwards emits nothing.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::body::{BodyPolicy, ReconstructedBody, StreamingBody};
use crate::capture::events::{RequestBodyDetails, WebRequestDetails, WebRequestEvent};
use crate::capture::host::{ContextId, WebRequestHost};
use crate::capture::ledger::{
    is_http, Ledger, LedgerLimits, RequestRecord, RequestSeen, ResponseSeen, EVICTED_ERROR,
};
use crate::config::Config;
use crate::headers::{merge_into, HeaderBatch};
use crate::sink::{EntrySink, Emitter};
use crate::Result;

pub struct WebRequestCapture {
    host: Arc<dyn WebRequestHost>,
    emitter: Emitter,
    policy: BodyPolicy,
    ledger: Ledger,
    streams: HashMap<String, StreamingBody>,
    listening: bool,
}

impl WebRequestCapture {
    pub fn new(host: Arc<dyn WebRequestHost>, sink: Arc<dyn EntrySink>, config: &Config) -> Result<Self> {
        Ok(Self {
            host,
            emitter: Emitter::new(sink),
            policy: BodyPolicy::from_config(config)?,
            ledger: Ledger::new(None, LedgerLimits::from_config(config)),
            streams: HashMap::new(),
            listening: false,
        })
    }

    pub fn pending_requests(&self) -> usize {
        self.ledger.len()
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn emitted(&self) -> u64 {
        self.emitter.emitted()
    }

    /// Register the lifecycle listeners on first use. Listeners are global,
    /// so later contexts are already covered.
    pub fn attach(&mut self, context_id: ContextId) -> bool {
        if !self.listening {
            if let Err(e) = self.host.add_listeners() {
                warn!("Failed to register webRequest listeners: {}", e);
                return false;
            }
            self.listening = true;
            info!("Capturing over webRequest with response filters");
        }
        debug!("Context {} covered by the webRequest listeners", context_id);
        true
    }

    /// Unregister listeners, disconnect open filters and drop all records.
    pub fn detach_all(&mut self) {
        if self.listening {
            self.host.remove_listeners();
            self.listening = false;
        }
        // dropping a stream disconnects its filter
        self.streams.clear();
        self.ledger.clear();
    }

    pub fn handle_event(&mut self, event: WebRequestEvent) -> Result<()> {
        if !self.listening {
            return Ok(());
        }

        self.apply(event);
        self.flush_evicted();
        Ok(())
    }

    fn apply(&mut self, event: WebRequestEvent) {
        match event {
            WebRequestEvent::BeforeRequest(d) => self.on_before_request(d),
            WebRequestEvent::BeforeSendHeaders(d) => {
                if self.ledger.contains(&d.request_id) {
                    let headers = d.request_headers.map(HeaderBatch::Pairs);
                    self.ledger.request_headers(&d.request_id, headers.as_ref());
                }
            }
            WebRequestEvent::HeadersReceived(d) => self.on_headers_received(d),
            WebRequestEvent::FilterData { request_id, data } => match self.streams.get_mut(&request_id) {
                Some(stream) => {
                    if let Err(e) = stream.on_data(data) {
                        warn!("Pass-through write failed for {}: {}", request_id, e);
                    }
                }
                None => debug!("Data for unknown stream {}", request_id),
            },
            WebRequestEvent::FilterStop { request_id } => {
                let Some(stream) = self.streams.remove(&request_id) else {
                    debug!("Stop for unknown stream {}", request_id);
                    return;
                };
                let body = stream.finish(&self.policy);
                match self.ledger.take(&request_id) {
                    Some(record) => {
                        let context_id = record.context_id;
                        let page_url = record.page_url();
                        let entry = record.into_success_entry(&self.policy, body);
                        self.emitter.emit(entry, context_id, page_url);
                    }
                    None => debug!("Stream for {} ended after finalization", request_id),
                }
            }
            WebRequestEvent::FilterError { request_id, error } => {
                self.streams.remove(&request_id);
                if self.ledger.take(&request_id).is_some() {
                    debug!("Dropping {} after filter error: {}", request_id, error);
                }
            }
            WebRequestEvent::Completed(d) => self.on_completed(d),
            WebRequestEvent::ErrorOccurred(d) => {
                self.streams.remove(&d.request_id);
                let Some(record) = self.ledger.take(&d.request_id) else {
                    return;
                };
                let error = d
                    .error
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| "errorOccurred".to_string());
                let context_id = record.context_id;
                let page_url = record.page_url();
                let entry = record.into_failure_entry(&self.policy, error);
                self.emitter.emit(entry, context_id, page_url);
            }
        }
    }

    /// Fail the transactions the ledger had to give up on. Their streams are
    /// disconnected.
    fn flush_evicted(&mut self) {
        for (id, record) in self.ledger.drain_evicted() {
            self.streams.remove(&id);
            let context_id = record.context_id;
            let page_url = record.page_url();
            let entry = record.into_failure_entry(&self.policy, EVICTED_ERROR.to_string());
            self.emitter.emit(entry, context_id, page_url);
        }
    }

    fn on_before_request(&mut self, d: WebRequestDetails) {
        let seen = RequestSeen {
            url: d.url,
            method: d.method,
            document_url: d.document_url,
            frame_id: d.frame_id.map(|id| id.to_string()),
            body: decode_request_body(d.request_body.as_ref()),
            headers: None,
            // redirects re-announce the same id
            restart: true,
        };
        if self.ledger.request_seen(&d.request_id, seen) {
            // a stream left over from the previous hop belongs to a dead response
            self.streams.remove(&d.request_id);
            if let Some(record) = self.ledger.get_mut(&d.request_id) {
                record.context_id = d.tab_id;
            }
        }
    }

    fn on_headers_received(&mut self, d: WebRequestDetails) {
        if !is_http(&d.url) || !self.ledger.contains(&d.request_id) {
            return;
        }

        let headers = d.response_headers.map(HeaderBatch::Pairs);
        let content_type = headers
            .as_ref()
            .and_then(|h| h.find("content-type"))
            .unwrap_or_default();
        self.ledger.response_seen(
            &d.request_id,
            ResponseSeen {
                status: d.status_code,
                status_text: d.status_line,
                headers,
                from_cache: d.from_cache,
                ..Default::default()
            },
        );

        if !self.host.supports_response_filter() {
            return;
        }
        match self.host.filter_response_data(&d.request_id) {
            Ok(filter) => {
                let stream = StreamingBody::new(filter, content_type, self.policy.max_body_bytes());
                self.streams.insert(d.request_id, stream);
            }
            Err(e) => debug!("No response filter for {}: {}", d.request_id, e),
        }
    }

    fn on_completed(&mut self, d: WebRequestDetails) {
        if !is_http(&d.url) {
            return;
        }

        let Some(mut record) = self.ledger.take(&d.request_id) else {
            debug!("Completion for finalized request {}", d.request_id);
            return;
        };
        if self.streams.remove(&d.request_id).is_some() {
            debug!("Request {} completed before its filter stopped", d.request_id);
        }
        complete_record(&mut record, &d);
        let context_id = record.context_id;
        let page_url = record.page_url();
        let entry = record.into_success_entry(&self.policy, ReconstructedBody::unavailable());
        self.emitter.emit(entry, context_id, page_url);
    }
}

fn complete_record(record: &mut RequestRecord, d: &WebRequestDetails) {
    if let Some(headers) = &d.response_headers {
        merge_into(&mut record.response_headers, Some(&HeaderBatch::Pairs(headers.clone())));
    }
    if d.status_code.is_some() {
        record.status = d.status_code;
    }
    if record.status_text.is_none() {
        record.status_text = d.status_line.clone();
    }
    if d.from_cache == Some(true) {
        record.served_from_cache = true;
    }
}

/// Flatten the webRequest request body into text. Form fields become
/// `key=value` pairs joined with `&`; raw upload parts are concatenated and
/// decoded as UTF-8.
pub fn decode_request_body(details: Option<&RequestBodyDetails>) -> Option<String> {
    let details = details?;
    if let Some(error) = &details.error {
        debug!("Request body unavailable: {}", error);
        return None;
    }

    if let Some(form) = &details.form_data {
        let pairs: Vec<String> = form
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |value| format!("{}={}", key, value)))
            .collect();
        return if pairs.is_empty() { None } else { Some(pairs.join("&")) };
    }

    let raw = details.raw.as_ref()?;
    let mut bytes = Vec::new();
    for part in raw {
        if let Some(chunk) = &part.bytes {
            bytes.extend_from_slice(chunk);
        }
    }
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl std::fmt::Debug for WebRequestCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRequestCapture")
            .field("pending", &self.ledger.len())
            .field("streams", &self.streams.len())
            .field("listening", &self.listening)
            .finish()
    }
}
