//! Recorded host sessions.
//!
//! A recording is a JSON-lines file, one host interaction per line, tagged
//! by `kind`:
//!
//! ```text
//! {"kind":"attach","tabId":1}
//! {"kind":"cdp","tabId":1,"method":"Network.requestWillBeSent","params":{...}}
//! {"kind":"responseBody","requestId":"1","body":"aGk=","base64Encoded":true}
//! {"kind":"webRequest","listener":"onBeforeRequest","details":{...}}
//! {"kind":"filterData","requestId":"7","data":"PGh0bWw+"}
//! {"kind":"filterStop","requestId":"7"}
//! {"kind":"filterError","requestId":"7","error":"Invalid request ID"}
//! ```
//!
//! [`ReplayDebugger`] and [`ReplayWebRequest`] play the host side: bodies
//! from `responseBody` lines answer `Network.getResponseBody`, and every
//! filter write and disconnect is recorded for inspection.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::capture::events::{DebuggerSource, HostEvent, WebRequestDetails, WebRequestEvent};
use crate::capture::host::{CommandTarget, ContextId, DebuggerHost, HostCapabilities, ResponseFilter, WebRequestHost};
use crate::capture::Capture;
use crate::{Error, Result};

/// webRequest's id for requests that belong to no tab.
pub const NO_TAB: ContextId = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ReplayRecord {
    #[serde(rename_all = "camelCase")]
    Attach { tab_id: ContextId },
    #[serde(rename_all = "camelCase")]
    Cdp {
        tab_id: ContextId,
        #[serde(default)]
        session_id: Option<String>,
        method: String,
        #[serde(default)]
        params: Value,
    },
    #[serde(rename_all = "camelCase")]
    ResponseBody {
        #[serde(default)]
        session_id: Option<String>,
        request_id: String,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        base64_encoded: bool,
    },
    WebRequest {
        listener: String,
        details: WebRequestDetails,
    },
    #[serde(rename_all = "camelCase")]
    FilterData { request_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    FilterStop { request_id: String },
    #[serde(rename_all = "camelCase")]
    FilterError {
        request_id: String,
        #[serde(default)]
        error: String,
    },
}

/// Counters for one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub records: usize,
    pub dispatched: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Replay {
    records: Vec<ReplayRecord>,
}

impl Replay {
    pub fn new(records: Vec<ReplayRecord>) -> Self {
        Self { records }
    }

    /// Parse a JSON-lines recording. Blank lines and `#` comments are skipped.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let record = serde_json::from_str(trimmed)
                .map_err(|e| Error::replay(format!("line {}: {}", index + 1, e)))?;
            records.push(record);
        }
        Ok(Self { records })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let replay = Self::parse(std::io::BufReader::new(file))?;
        info!("Loaded {} records from {}", replay.len(), path.as_ref().display());
        Ok(replay)
    }

    pub fn records(&self) -> &[ReplayRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Host capabilities implied by the recording: a debugger when it holds
    /// protocol traffic, a streaming webRequest host when it holds lifecycle
    /// or filter traffic.
    pub fn capabilities(&self) -> HostCapabilities {
        let mut caps = HostCapabilities::default();
        let wants_debugger = self
            .records
            .iter()
            .any(|r| matches!(r, ReplayRecord::Cdp { .. } | ReplayRecord::ResponseBody { .. }));
        let wants_web_request = self.records.iter().any(|r| {
            matches!(
                r,
                ReplayRecord::WebRequest { .. }
                    | ReplayRecord::FilterData { .. }
                    | ReplayRecord::FilterStop { .. }
                    | ReplayRecord::FilterError { .. }
            )
        });

        if wants_debugger {
            let debugger = ReplayDebugger::new();
            for record in &self.records {
                if let ReplayRecord::ResponseBody {
                    session_id,
                    request_id,
                    body,
                    base64_encoded,
                } = record
                {
                    debugger.add_body(session_id.as_deref(), request_id, body.clone(), *base64_encoded);
                }
            }
            caps.debugger = Some(Arc::new(debugger));
        }
        if wants_web_request {
            caps.web_request = Some(Arc::new(ReplayWebRequest::new(true)));
        }
        caps
    }

    /// Feed every record to `capture`. Contexts are attached on first
    /// sight when the recording has no explicit `attach` line for them.
    pub async fn run(&self, capture: &mut Capture) -> Result<ReplayStats> {
        let mut stats = ReplayStats {
            records: self.records.len(),
            ..Default::default()
        };
        let mut attached = HashSet::new();

        for record in &self.records {
            let event = match record {
                ReplayRecord::Attach { tab_id } => {
                    ensure_attached(capture, &mut attached, *tab_id).await;
                    continue;
                }
                ReplayRecord::ResponseBody { .. } => continue,
                ReplayRecord::Cdp {
                    tab_id,
                    session_id,
                    method,
                    params,
                } => {
                    ensure_attached(capture, &mut attached, *tab_id).await;
                    let source = DebuggerSource {
                        tab_id: Some(*tab_id),
                        session_id: session_id.clone(),
                    };
                    HostEvent::protocol(source, method, params.clone())
                }
                ReplayRecord::WebRequest { listener, details } => {
                    ensure_attached(capture, &mut attached, details.tab_id.unwrap_or(NO_TAB)).await;
                    WebRequestEvent::from_listener(listener, details.clone()).map(HostEvent::from)
                }
                ReplayRecord::FilterData { request_id, data } => STANDARD
                    .decode(data.as_bytes())
                    .map_err(Error::from)
                    .map(|bytes| {
                        HostEvent::from(WebRequestEvent::FilterData {
                            request_id: request_id.clone(),
                            data: Bytes::from(bytes),
                        })
                    }),
                ReplayRecord::FilterStop { request_id } => Ok(HostEvent::from(WebRequestEvent::FilterStop {
                    request_id: request_id.clone(),
                })),
                ReplayRecord::FilterError { request_id, error } => {
                    Ok(HostEvent::from(WebRequestEvent::FilterError {
                        request_id: request_id.clone(),
                        error: error.clone(),
                    }))
                }
            };

            match event {
                Ok(event) => {
                    capture.dispatch(event).await;
                    stats.dispatched += 1;
                }
                Err(e) => {
                    warn!("Skipping unusable record: {}", e);
                    stats.skipped += 1;
                }
            }
        }

        debug!("Replay finished: {:?}", stats);
        Ok(stats)
    }
}

async fn ensure_attached(capture: &mut Capture, attached: &mut HashSet<ContextId>, tab_id: ContextId) {
    if attached.insert(tab_id) && !capture.attach(tab_id).await {
        warn!("Replay could not attach context {}", tab_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type BodyKey = (Option<String>, String);

/// Debugger host answering from recorded bodies.
#[derive(Debug, Default)]
pub struct ReplayDebugger {
    bodies: Mutex<HashMap<BodyKey, Value>>,
    refused: Mutex<HashSet<ContextId>>,
    attached: Mutex<HashSet<ContextId>>,
    commands: Mutex<Vec<(CommandTarget, String, Value)>>,
}

impl ReplayDebugger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_body(&self, session_id: Option<&str>, request_id: &str, body: Option<String>, base64_encoded: bool) {
        let key = (session_id.map(str::to_string), request_id.to_string());
        lock(&self.bodies).insert(key, json!({"body": body, "base64Encoded": base64_encoded}));
    }

    /// Make attaching to `tab_id` fail as if another debugger held it.
    pub fn refuse_attach(&self, tab_id: ContextId) {
        lock(&self.refused).insert(tab_id);
    }

    pub fn is_attached(&self, tab_id: ContextId) -> bool {
        lock(&self.attached).contains(&tab_id)
    }

    /// Every command sent so far, in order.
    pub fn commands(&self) -> Vec<(CommandTarget, String, Value)> {
        lock(&self.commands).clone()
    }
}

#[async_trait]
impl DebuggerHost for ReplayDebugger {
    async fn attach(&self, tab_id: ContextId, _protocol_version: &str) -> Result<()> {
        if lock(&self.refused).contains(&tab_id) {
            return Err(Error::attach(format!("Another debugger is already attached to tab {}", tab_id)));
        }
        lock(&self.attached).insert(tab_id);
        Ok(())
    }

    async fn detach(&self, tab_id: ContextId) -> Result<()> {
        if lock(&self.attached).remove(&tab_id) {
            Ok(())
        } else {
            Err(Error::host(format!("Debugger is not attached to tab {}", tab_id)))
        }
    }

    async fn send_command(&self, target: &CommandTarget, method: &str, params: Value) -> Result<Value> {
        lock(&self.commands).push((target.clone(), method.to_string(), params.clone()));

        if method != "Network.getResponseBody" {
            return Ok(json!({}));
        }
        let request_id = params
            .get("requestId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::malformed_event("getResponseBody without requestId"))?;
        let key = (target.session_id.clone(), request_id.to_string());
        lock(&self.bodies)
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::body_unavailable("No resource with given identifier found"))
    }
}

#[derive(Debug, Default)]
struct FilterLog {
    written: HashMap<String, Vec<u8>>,
    disconnects: Vec<String>,
}

/// webRequest host whose filters record what passes through them.
#[derive(Debug)]
pub struct ReplayWebRequest {
    supports_filter: bool,
    listening: AtomicBool,
    refused: Mutex<HashSet<String>>,
    log: Arc<Mutex<FilterLog>>,
}

impl ReplayWebRequest {
    pub fn new(supports_filter: bool) -> Self {
        Self {
            supports_filter,
            listening: AtomicBool::new(false),
            refused: Mutex::new(HashSet::new()),
            log: Arc::new(Mutex::new(FilterLog::default())),
        }
    }

    /// Make `filter_response_data` fail for one request.
    pub fn refuse_filter(&self, request_id: &str) {
        lock(&self.refused).insert(request_id.to_string());
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Bytes written back to the page for a request.
    pub fn passed_through(&self, request_id: &str) -> Vec<u8> {
        lock(&self.log).written.get(request_id).cloned().unwrap_or_default()
    }

    /// Request ids whose filters were disconnected, in order.
    pub fn disconnects(&self) -> Vec<String> {
        lock(&self.log).disconnects.clone()
    }
}

impl WebRequestHost for ReplayWebRequest {
    fn supports_response_filter(&self) -> bool {
        self.supports_filter
    }

    fn add_listeners(&self) -> Result<()> {
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn remove_listeners(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    fn filter_response_data(&self, request_id: &str) -> Result<Box<dyn ResponseFilter>> {
        if !self.supports_filter || lock(&self.refused).contains(request_id) {
            return Err(Error::filter(format!("Cannot filter response for {}", request_id)));
        }
        Ok(Box::new(ReplayFilter {
            request_id: request_id.to_string(),
            log: self.log.clone(),
            open: true,
        }))
    }
}

struct ReplayFilter {
    request_id: String,
    log: Arc<Mutex<FilterLog>>,
    open: bool,
}

impl ResponseFilter for ReplayFilter {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::filter(format!("Filter for {} is disconnected", self.request_id)));
        }
        lock(&self.log)
            .written
            .entry(self.request_id.clone())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.open {
            self.open = false;
            lock(&self.log).disconnects.push(self.request_id.clone());
        }
    }
}
