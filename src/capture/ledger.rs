//! Per-transaction accumulator shared by both capture backends.
//!
//! A [`RequestRecord`] is created lazily by the first event naming an unknown
//! transaction id, mutated in place by every later event for that id, and
//! removed when the transaction is finalized. Records that never see a
//! request-observed event (and so never learn their url) are dropped at
//! finalization without producing an entry. Observed records pushed out by
//! the retention bounds are queued for the backend to fail with
//! [`EVICTED_ERROR`].

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::body::{BodyPolicy, ReconstructedBody};
use crate::capture::host::ContextId;
use crate::config::Config;
use crate::entry::{CaptureEntry, EntryMeta, RequestSide, ResponseFailure, ResponseSide, ResponseSuccess};
use crate::headers::{merge_into, HeaderBatch, HeaderMap};

/// Network error reported for transactions evicted before they finished.
pub const EVICTED_ERROR: &str = "evicted";

/// Only http and https transactions are tracked.
pub fn is_http(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

/// Everything known so far about one in-flight exchange.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub ts: i64,
    pub created: Instant,
    pub context_id: Option<ContextId>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub document_url: Option<String>,
    /// Page url to fall back to when the request names no document.
    pub page_hint: Option<String>,
    pub frame_id: Option<String>,
    pub request_body: Option<String>,
    pub request_headers: HeaderMap,
    /// Raw request headers merged since the last request or response event.
    /// They belong to the upcoming hop when a redirect follows.
    pending_raw_headers: HeaderMap,
    pub response_headers: HeaderMap,
    pub status: Option<u16>,
    pub status_text: Option<String>,
    pub mime_type: Option<String>,
    pub served_from_cache: bool,
    pub from_service_worker: bool,
    pub timing: Option<Value>,
}

impl RequestRecord {
    pub fn new(context_id: Option<ContextId>) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            created: Instant::now(),
            context_id,
            url: None,
            method: None,
            document_url: None,
            page_hint: None,
            frame_id: None,
            request_body: None,
            request_headers: HeaderMap::new(),
            pending_raw_headers: HeaderMap::new(),
            response_headers: HeaderMap::new(),
            status: None,
            status_text: None,
            mime_type: None,
            served_from_cache: false,
            from_service_worker: false,
            timing: None,
        }
    }

    /// Whether the request itself has been observed.
    pub fn is_observed(&self) -> bool {
        self.url.is_some()
    }

    /// Start the next hop of a redirected transaction. Response state and
    /// the previous hop's request side are dropped; raw request headers that
    /// arrived ahead of the new hop are kept.
    fn restart(&mut self) {
        self.request_headers = std::mem::take(&mut self.pending_raw_headers);
        self.request_body = None;
        self.response_headers.clear();
        self.status = None;
        self.status_text = None;
        self.mime_type = None;
        self.served_from_cache = false;
        self.from_service_worker = false;
        self.timing = None;
    }

    pub fn page_url(&self) -> Option<String> {
        self.document_url.clone().or_else(|| self.page_hint.clone())
    }

    fn meta(&self) -> EntryMeta {
        EntryMeta {
            timestamp: self.ts,
            browsing_context_id: self.context_id,
            page_url: self.page_url(),
            frame_id: self.frame_id.clone(),
        }
    }

    fn request_side(&self, policy: &BodyPolicy) -> RequestSide {
        let body = policy.request_body(self.request_body.as_deref());
        RequestSide {
            url: self.url.clone().unwrap_or_default(),
            method: self.method.clone().unwrap_or_else(|| "GET".to_string()),
            headers: self.request_headers.clone(),
            body: body.body,
            body_encoding: body.encoding,
            body_size: body.size,
            truncated: body.truncated,
        }
    }

    /// Assemble the success shape from the accumulated state and a body.
    pub fn into_success_entry(self, policy: &BodyPolicy, body: ReconstructedBody) -> CaptureEntry {
        let meta = self.meta();
        let request = self.request_side(policy);
        CaptureEntry {
            meta,
            request,
            response: ResponseSide::Success(ResponseSuccess {
                status: self.status.unwrap_or(0),
                status_text: self.status_text.unwrap_or_default(),
                headers: self.response_headers,
                body: body.body,
                body_encoding: body.encoding,
                body_size: body.size,
                truncated: body.truncated,
                served_from_cache: self.served_from_cache,
                from_service_worker: self.from_service_worker,
            }),
        }
    }

    /// Assemble the failure shape: request side as far as known, response
    /// reduced to the error text.
    pub fn into_failure_entry(self, policy: &BodyPolicy, network_error: String) -> CaptureEntry {
        CaptureEntry {
            meta: self.meta(),
            request: self.request_side(policy),
            response: ResponseSide::Failure(ResponseFailure { network_error }),
        }
    }
}

/// Request-observed phase payload.
#[derive(Debug, Clone, Default)]
pub struct RequestSeen {
    pub url: String,
    pub method: Option<String>,
    pub document_url: Option<String>,
    pub frame_id: Option<String>,
    pub body: Option<String>,
    pub headers: Option<HeaderBatch>,
    /// Start the record over (protocol redirects reuse the transaction id).
    pub restart: bool,
}

/// Response-observed phase payload.
#[derive(Debug, Clone, Default)]
pub struct ResponseSeen {
    pub status: Option<u16>,
    pub status_text: Option<String>,
    pub mime_type: Option<String>,
    pub headers: Option<HeaderBatch>,
    pub from_service_worker: Option<bool>,
    pub from_cache: Option<bool>,
    pub timing: Option<Value>,
}

/// Retention bounds for transactions the host never finalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerLimits {
    /// Zero means unbounded.
    pub max_pending: usize,
    pub stale_after: Option<Duration>,
}

impl Default for LedgerLimits {
    fn default() -> Self {
        Self {
            max_pending: 4096,
            stale_after: None,
        }
    }
}

impl LedgerLimits {
    pub fn unbounded() -> Self {
        Self {
            max_pending: 0,
            stale_after: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            max_pending: config.max_pending_requests,
            stale_after: config.stale_after(),
        }
    }
}

/// In-flight transactions of one browsing context, keyed by host transaction id.
#[derive(Debug, Clone)]
pub struct Ledger {
    context_id: Option<ContextId>,
    records: IndexMap<String, RequestRecord>,
    filtered: HashSet<String>,
    evicted: Vec<(String, RequestRecord)>,
    limits: LedgerLimits,
}

impl Ledger {
    pub fn new(context_id: Option<ContextId>, limits: LedgerLimits) -> Self {
        Self {
            context_id,
            records: IndexMap::new(),
            filtered: HashSet::new(),
            evicted: Vec::new(),
            limits,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&RequestRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut RequestRecord> {
        self.records.get_mut(id)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.filtered.clear();
        self.evicted.clear();
    }

    /// Whether `id` was seen with a non-HTTP url and is being ignored.
    pub fn is_filtered(&self, id: &str) -> bool {
        self.filtered.contains(id)
    }

    /// Fetch or lazily create the record for `id`. Returns `None` for ids
    /// filtered out as non-HTTP.
    pub fn record_mut(&mut self, id: &str) -> Option<&mut RequestRecord> {
        if self.filtered.contains(id) {
            return None;
        }
        if !self.records.contains_key(id) {
            self.make_room(Instant::now());
            self.records
                .insert(id.to_string(), RequestRecord::new(self.context_id));
        }
        self.records.get_mut(id)
    }

    /// Request observed. Non-HTTP urls are filtered here and any record
    /// built from earlier raw events is discarded. Returns whether the
    /// transaction is tracked.
    pub fn request_seen(&mut self, id: &str, seen: RequestSeen) -> bool {
        if !is_http(&seen.url) {
            debug!("Ignoring non-HTTP request {} ({})", id, seen.url);
            self.records.shift_remove(id);
            self.remember_filtered(id);
            return false;
        }
        self.filtered.remove(id);

        let Some(record) = self.record_mut(id) else {
            return false;
        };
        if seen.restart && record.is_observed() {
            debug!("Request {} redirected from {:?}", id, record.url);
            record.restart();
        }
        record.pending_raw_headers.clear();
        record.url = Some(seen.url);
        if seen.method.is_some() {
            record.method = seen.method;
        }
        if seen.document_url.is_some() {
            record.document_url = seen.document_url;
        }
        if seen.frame_id.is_some() {
            record.frame_id = seen.frame_id;
        }
        if seen.body.is_some() {
            record.request_body = seen.body;
        }
        merge_into(&mut record.request_headers, seen.headers.as_ref());
        true
    }

    /// Raw or outgoing request headers.
    pub fn request_headers(&mut self, id: &str, headers: Option<&HeaderBatch>) {
        if let Some(record) = self.record_mut(id) {
            merge_into(&mut record.request_headers, headers);
            merge_into(&mut record.pending_raw_headers, headers);
        }
    }

    /// Response observed. Unknown ids are ignored.
    pub fn response_seen(&mut self, id: &str, seen: ResponseSeen) {
        let Some(record) = self.records.get_mut(id) else {
            debug!("Response for unknown request {}", id);
            return;
        };
        if seen.status.is_some() {
            record.status = seen.status;
        }
        if seen.status_text.is_some() {
            record.status_text = seen.status_text;
        }
        if seen.mime_type.is_some() {
            record.mime_type = seen.mime_type;
        }
        if let Some(from_service_worker) = seen.from_service_worker {
            record.from_service_worker = from_service_worker;
        }
        if seen.from_cache == Some(true) {
            record.served_from_cache = true;
        }
        if seen.timing.is_some() {
            record.timing = seen.timing;
        }
        record.pending_raw_headers.clear();
        merge_into(&mut record.response_headers, seen.headers.as_ref());
    }

    /// Raw response headers. A numeric status here overrides the earlier one.
    pub fn response_headers(&mut self, id: &str, headers: Option<&HeaderBatch>, status: Option<u16>) {
        if let Some(record) = self.record_mut(id) {
            record.pending_raw_headers.clear();
            merge_into(&mut record.response_headers, headers);
            if status.is_some() {
                record.status = status;
            }
        }
    }

    /// Served-from-cache marker. Unknown ids are an expected race.
    pub fn served_from_cache(&mut self, id: &str) {
        match self.records.get_mut(id) {
            Some(record) => record.served_from_cache = true,
            None => debug!("Cache marker for unknown request {}", id),
        }
    }

    /// Remove a transaction for finalization. Records that never learned
    /// their url are discarded and `None` is returned.
    pub fn take(&mut self, id: &str) -> Option<RequestRecord> {
        self.filtered.remove(id);
        let record = self.records.shift_remove(id)?;
        if record.is_observed() {
            Some(record)
        } else {
            debug!("Dropping request {} that was never observed", id);
            None
        }
    }

    /// Evict records older than the configured age. Observed ones are
    /// queued for [`Ledger::drain_evicted`].
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let Some(max_age) = self.limits.stale_after else {
            return 0;
        };
        let stale: Vec<String> = self
            .records
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.created) >= max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(record) = self.records.shift_remove(id) {
                self.queue_evicted(id, record);
            }
        }
        stale.len()
    }

    /// Records pushed out by the retention bounds since the last call, with
    /// their transaction ids.
    pub fn drain_evicted(&mut self) -> Vec<(String, RequestRecord)> {
        std::mem::take(&mut self.evicted)
    }

    fn make_room(&mut self, now: Instant) {
        self.evict_stale(now);
        if self.limits.max_pending == 0 {
            return;
        }
        while self.records.len() >= self.limits.max_pending {
            match self.records.shift_remove_index(0) {
                Some((id, record)) => self.queue_evicted(&id, record),
                None => break,
            }
        }
    }

    fn queue_evicted(&mut self, id: &str, record: RequestRecord) {
        if record.is_observed() {
            debug!("Evicted pending request {} ({:?})", id, record.url);
            self.evicted.push((id.to_string(), record));
        } else {
            debug!("Evicted unobserved request {}", id);
        }
    }

    fn remember_filtered(&mut self, id: &str) {
        if self.limits.max_pending > 0 && self.filtered.len() >= self.limits.max_pending {
            self.filtered.clear();
        }
        self.filtered.insert(id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::BodyEncoding;
    use serde_json::json;

    fn seen(url: &str) -> RequestSeen {
        RequestSeen {
            url: url.to_string(),
            method: Some("GET".to_string()),
            ..Default::default()
        }
    }

    fn headers(value: Value) -> HeaderBatch {
        HeaderBatch::from_value(&value).unwrap()
    }

    #[test]
    fn test_is_http() {
        assert!(is_http("http://example.com/"));
        assert!(is_http("HTTPS://example.com/"));
        assert!(!is_http("ws://example.com/socket"));
        assert!(!is_http("chrome-extension://abc/script.js"));
        assert!(!is_http("data:text/plain,hi"));
        assert!(!is_http("not a url"));
    }

    #[test]
    fn test_non_http_creates_nothing() {
        let mut ledger = Ledger::new(Some(1), LedgerLimits::default());
        assert!(!ledger.request_seen("1", seen("chrome-extension://abc/x.js")));
        ledger.request_headers("1", Some(&headers(json!({"A": "1"}))));
        ledger.response_headers("1", None, Some(200));
        assert!(ledger.is_empty());
        assert!(ledger.take("1").is_none());
        assert!(!ledger.is_filtered("1"));
    }

    #[test]
    fn test_raw_headers_before_request() {
        let mut ledger = Ledger::new(Some(1), LedgerLimits::default());
        ledger.request_headers("1", Some(&headers(json!({"Cookie": "a=b"}))));
        assert!(ledger.request_seen(
            "1",
            RequestSeen {
                headers: Some(headers(json!({"Accept": "*/*"}))),
                ..seen("https://a.test/")
            }
        ));

        let record = ledger.take("1").unwrap();
        assert_eq!(record.request_headers["Cookie"], "a=b");
        assert_eq!(record.request_headers["Accept"], "*/*");
    }

    #[test]
    fn test_raw_status_overrides() {
        let mut ledger = Ledger::new(None, LedgerLimits::default());
        ledger.request_seen("1", seen("https://a.test/"));
        ledger.response_seen(
            "1",
            ResponseSeen {
                status: Some(200),
                status_text: Some("OK".to_string()),
                ..Default::default()
            },
        );
        ledger.response_headers("1", Some(&headers(json!({"Set-Cookie": "x"}))), Some(304));

        let record = ledger.take("1").unwrap();
        assert_eq!(record.status, Some(304));
        assert_eq!(record.status_text.as_deref(), Some("OK"));
        assert_eq!(record.response_headers["Set-Cookie"], "x");
    }

    #[test]
    fn test_unobserved_record_is_dropped() {
        let mut ledger = Ledger::new(None, LedgerLimits::default());
        ledger.request_headers("1", Some(&headers(json!({"A": "1"}))));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.take("1").is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_unknown_ids_are_noops() {
        let mut ledger = Ledger::new(None, LedgerLimits::default());
        ledger.served_from_cache("missing");
        ledger.response_seen("missing", ResponseSeen::default());
        assert!(ledger.is_empty());
        assert!(ledger.take("missing").is_none());
    }

    #[test]
    fn test_restart_discards_previous_hop() {
        let mut ledger = Ledger::new(None, LedgerLimits::default());
        ledger.request_seen("1", seen("http://a.test/"));
        ledger.response_seen(
            "1",
            ResponseSeen {
                status: Some(301),
                ..Default::default()
            },
        );
        ledger.request_seen(
            "1",
            RequestSeen {
                restart: true,
                ..seen("https://a.test/")
            },
        );

        let record = ledger.take("1").unwrap();
        assert_eq!(record.url.as_deref(), Some("https://a.test/"));
        assert_eq!(record.status, None);
    }

    #[test]
    fn test_restart_keeps_headers_for_next_hop() {
        let mut ledger = Ledger::new(None, LedgerLimits::default());
        ledger.request_seen("1", seen("http://a.test/"));
        ledger.request_headers("1", Some(&headers(json!({"Accept": "text/html"}))));
        ledger.response_headers("1", Some(&headers(json!({"Location": "https://a.test/"}))), Some(301));
        ledger.request_headers("1", Some(&headers(json!({"Cookie": "sid=1"}))));
        ledger.request_seen(
            "1",
            RequestSeen {
                restart: true,
                ..seen("https://a.test/")
            },
        );

        let record = ledger.take("1").unwrap();
        assert_eq!(record.request_headers.len(), 1);
        assert_eq!(record.request_headers["Cookie"], "sid=1");
        assert!(record.response_headers.is_empty());
        assert_eq!(record.status, None);
    }

    #[test]
    fn test_max_pending_evicts_oldest() {
        let limits = LedgerLimits {
            max_pending: 2,
            stale_after: None,
        };
        let mut ledger = Ledger::new(None, limits);
        ledger.request_seen("1", seen("https://a.test/1"));
        ledger.request_seen("2", seen("https://a.test/2"));
        ledger.request_seen("3", seen("https://a.test/3"));

        assert_eq!(ledger.len(), 2);
        assert!(!ledger.contains("1"));
        assert!(ledger.contains("3"));

        let evicted = ledger.drain_evicted();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "1");
        assert_eq!(evicted[0].1.url.as_deref(), Some("https://a.test/1"));
        assert!(ledger.drain_evicted().is_empty());
    }

    #[test]
    fn test_unobserved_eviction_is_not_queued() {
        let limits = LedgerLimits {
            max_pending: 1,
            stale_after: None,
        };
        let mut ledger = Ledger::new(None, limits);
        ledger.request_headers("1", Some(&headers(json!({"A": "1"}))));
        ledger.request_seen("2", seen("https://a.test/2"));

        assert!(!ledger.contains("1"));
        assert!(ledger.drain_evicted().is_empty());
    }

    #[test]
    fn test_stale_eviction_is_off_by_default() {
        let mut ledger = Ledger::new(None, LedgerLimits::default());
        ledger.request_seen("1", seen("https://a.test/"));
        assert_eq!(ledger.evict_stale(Instant::now() + Duration::from_secs(86_400)), 0);
        assert!(ledger.contains("1"));
    }

    #[test]
    fn test_evict_stale() {
        let limits = LedgerLimits {
            max_pending: 0,
            stale_after: Some(Duration::from_secs(10)),
        };
        let mut ledger = Ledger::new(None, limits);
        ledger.request_seen("1", seen("https://a.test/"));

        assert_eq!(ledger.evict_stale(Instant::now()), 0);
        assert_eq!(ledger.evict_stale(Instant::now() + Duration::from_secs(11)), 1);
        assert!(ledger.is_empty());

        let (_, record) = ledger.drain_evicted().remove(0);
        let entry = record.into_failure_entry(&BodyPolicy::default(), EVICTED_ERROR.to_string());
        assert_eq!(entry.network_error(), Some("evicted"));
        assert_eq!(entry.request.url, "https://a.test/");
    }

    #[test]
    fn test_failure_entry_keeps_partial_request() {
        let mut ledger = Ledger::new(Some(4), LedgerLimits::default());
        ledger.request_seen(
            "1",
            RequestSeen {
                method: Some("POST".to_string()),
                body: Some("a=1".to_string()),
                document_url: Some("https://a.test/page".to_string()),
                ..seen("https://a.test/api")
            },
        );

        let entry = ledger
            .take("1")
            .unwrap()
            .into_failure_entry(&BodyPolicy::default(), "net::ERR_FAILED".to_string());

        assert_eq!(entry.request.url, "https://a.test/api");
        assert_eq!(entry.request.method, "POST");
        assert_eq!(entry.request.body_encoding, BodyEncoding::Text);
        assert_eq!(entry.request.body_size, 3);
        assert_eq!(entry.network_error(), Some("net::ERR_FAILED"));
        assert_eq!(entry.meta.browsing_context_id, Some(4));
        assert_eq!(entry.meta.page_url.as_deref(), Some("https://a.test/page"));
    }

    #[test]
    fn test_success_entry_defaults() {
        let mut ledger = Ledger::new(None, LedgerLimits::default());
        ledger.request_seen(
            "1",
            RequestSeen {
                method: None,
                ..seen("https://a.test/")
            },
        );

        let entry = ledger
            .take("1")
            .unwrap()
            .into_success_entry(&BodyPolicy::default(), ReconstructedBody::unavailable());
        let response = entry.success().unwrap();
        assert_eq!(entry.request.method, "GET");
        assert_eq!(entry.request.body, None);
        assert_eq!(entry.request.body_encoding, BodyEncoding::None);
        assert_eq!(response.status, 0);
        assert_eq!(response.body_encoding, BodyEncoding::None);
        assert!(!response.truncated);
    }
}
