//! Protocol-style capture backend (debugger hosts).
//!
//! High-level notifications (`requestWillBeSent`, `responseReceived`) and raw
//! on-wire notifications (`*ExtraInfo`) for the same transaction arrive in no
//! particular order; both are merged into the owning session's ledger. On
//! `loadingFinished` the body is pulled once from the host, on
//! `loadingFailed` a failure entry is emitted from whatever was accumulated.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::body::{BodyPolicy, ReconstructedBody};
use crate::capture::commands::{self, GetResponseBody, NetworkEnable, ResponseBody, SetAutoAttach};
use crate::capture::events::{status_code, CdpEvent, DebuggerSource, RequestWillBeSent};
use crate::capture::host::{CommandTarget, ContextId, DebuggerHost};
use crate::capture::ledger::{LedgerLimits, RequestSeen, ResponseSeen, EVICTED_ERROR};
use crate::capture::session::{SessionKey, SessionRegistry};
use crate::config::Config;
use crate::headers::HeaderBatch;
use crate::sink::{EntrySink, Emitter};
use crate::Result;

pub struct ProtocolCapture {
    host: Arc<dyn DebuggerHost>,
    emitter: Emitter,
    policy: BodyPolicy,
    sessions: SessionRegistry,
    attached_tabs: HashSet<ContextId>,
    listening: bool,
    protocol_version: String,
    auto_attach_targets: bool,
}

impl ProtocolCapture {
    pub fn new(host: Arc<dyn DebuggerHost>, sink: Arc<dyn EntrySink>, config: &Config) -> Result<Self> {
        Ok(Self {
            host,
            emitter: Emitter::new(sink),
            policy: BodyPolicy::from_config(config)?,
            sessions: SessionRegistry::new(LedgerLimits::from_config(config)),
            attached_tabs: HashSet::new(),
            listening: false,
            protocol_version: config.protocol_version.clone(),
            auto_attach_targets: config.auto_attach_targets,
        })
    }

    pub fn is_attached(&self, tab_id: ContextId) -> bool {
        self.attached_tabs.contains(&tab_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.sessions.pending()
    }

    pub fn emitted(&self) -> u64 {
        self.emitter.emitted()
    }

    /// Attach the debugger to a tab and enable network observation on it.
    /// Re-attaching a tracked tab is a no-op that reports success; a host
    /// refusal reports failure and leaves no state behind.
    pub async fn attach(&mut self, tab_id: ContextId) -> bool {
        if self.attached_tabs.contains(&tab_id) {
            return true;
        }

        if let Err(e) = self.host.attach(tab_id, &self.protocol_version).await {
            warn!("Failed to attach debugger to tab {}: {}", tab_id, e);
            return false;
        }
        self.attached_tabs.insert(tab_id);

        let target = CommandTarget::tab(tab_id);
        if let Err(e) = commands::send(self.host.as_ref(), &target, &NetworkEnable::default()).await {
            warn!("Network.enable failed for tab {}: {}", tab_id, e);
        }
        if self.auto_attach_targets {
            if let Err(e) = commands::send(self.host.as_ref(), &target, &SetAutoAttach::default()).await {
                warn!("Target.setAutoAttach failed for tab {}: {}", tab_id, e);
            }
        }

        self.listening = true;
        info!("Capturing tab {} over the debugger protocol", tab_id);
        true
    }

    /// Stop listening, detach every tab and drop all outstanding ledgers.
    pub async fn detach_all(&mut self) {
        self.listening = false;
        for tab_id in self.attached_tabs.drain() {
            if let Err(e) = self.host.detach(tab_id).await {
                debug!("Detaching tab {} failed: {}", tab_id, e);
            }
        }
        let dropped = self.sessions.pending();
        self.sessions.clear();
        if dropped > 0 {
            info!("Detached with {} in-flight requests abandoned", dropped);
        }
    }

    pub async fn handle_event(&mut self, source: &DebuggerSource, event: CdpEvent) -> Result<()> {
        if !self.listening {
            return Ok(());
        }
        let Some(tab_id) = source.tab_id else {
            debug!("Ignoring {} without a tab", event.event_name());
            return Ok(());
        };
        if !self.attached_tabs.contains(&tab_id) {
            debug!("Ignoring {} for untracked tab {}", event.event_name(), tab_id);
            return Ok(());
        }

        let key = match &source.session_id {
            Some(session_id) => SessionKey::child(tab_id, session_id.clone()),
            None => SessionKey::main(tab_id),
        };

        let result = self.apply(tab_id, key, event).await;
        self.flush_evicted();
        result
    }

    async fn apply(&mut self, tab_id: ContextId, key: SessionKey, event: CdpEvent) -> Result<()> {
        match event {
            CdpEvent::AttachedToTarget(e) => {
                let child = SessionKey::child(tab_id, e.session_id);
                let (session, created) = self.sessions.ensure(&child);
                if e.target_info.url.is_some() {
                    session.target_url = e.target_info.url;
                }
                if created {
                    let target = child.target();
                    if let Err(e) =
                        commands::send(self.host.as_ref(), &target, &NetworkEnable::default()).await
                    {
                        warn!("Network.enable failed for session {}: {}", child, e);
                    }
                }
            }
            CdpEvent::DetachedFromTarget(e) => {
                let child = SessionKey::child(tab_id, e.session_id);
                if let Some(session) = self.sessions.remove(&child) {
                    debug!(
                        "Session {} detached with {} in-flight requests",
                        child,
                        session.ledger.len()
                    );
                }
            }
            CdpEvent::RequestWillBeSent(e) => self.on_request(&key, e),
            CdpEvent::RequestWillBeSentExtraInfo(e) => {
                let headers = e.headers.as_ref().and_then(HeaderBatch::from_value);
                let (session, _) = self.sessions.ensure(&key);
                session.ledger.request_headers(&e.request_id, headers.as_ref());
            }
            CdpEvent::ResponseReceived(e) => {
                if let Some(session) = self.sessions.get_mut(&key) {
                    let response = e.response;
                    session.ledger.response_seen(
                        &e.request_id,
                        ResponseSeen {
                            status: status_code(response.status.as_ref()),
                            status_text: response.status_text,
                            mime_type: response.mime_type,
                            headers: response.headers.as_ref().and_then(HeaderBatch::from_value),
                            from_service_worker: Some(response.from_service_worker.unwrap_or(false)),
                            from_cache: None,
                            timing: response.timing,
                        },
                    );
                }
            }
            CdpEvent::ResponseReceivedExtraInfo(e) => {
                let headers = e.headers.as_ref().and_then(HeaderBatch::from_value);
                let status = status_code(e.status_code.as_ref());
                let (session, _) = self.sessions.ensure(&key);
                session.ledger.response_headers(&e.request_id, headers.as_ref(), status);
            }
            CdpEvent::RequestServedFromCache(e) => {
                if let Some(session) = self.sessions.get_mut(&key) {
                    session.ledger.served_from_cache(&e.request_id);
                }
            }
            CdpEvent::LoadingFailed(e) => {
                let Some(record) = self
                    .sessions
                    .get_mut(&key)
                    .and_then(|session| session.ledger.take(&e.request_id))
                else {
                    return Ok(());
                };
                let error_text = match (e.error_text, e.canceled) {
                    (Some(text), _) if !text.is_empty() => text,
                    (_, Some(true)) => "canceled".to_string(),
                    _ => "loadingFailed".to_string(),
                };
                let page_url = record.page_url();
                let entry = record.into_failure_entry(&self.policy, error_text);
                self.emitter.emit(entry, Some(tab_id), page_url);
            }
            CdpEvent::LoadingFinished(e) => {
                let Some(record) = self
                    .sessions
                    .get_mut(&key)
                    .and_then(|session| session.ledger.take(&e.request_id))
                else {
                    return Ok(());
                };
                let body = fetch_body(self.host.as_ref(), &self.policy, &key, &e.request_id).await;
                let page_url = record.page_url();
                let entry = record.into_success_entry(&self.policy, body);
                self.emitter.emit(entry, Some(tab_id), page_url);
            }
            CdpEvent::Other(method) => {
                debug!("Ignoring {} on {}", method, key);
            }
        }

        Ok(())
    }

    /// Fail the transactions the ledgers had to give up on.
    fn flush_evicted(&mut self) {
        for (_, record) in self.sessions.drain_evicted() {
            let context_id = record.context_id;
            let page_url = record.page_url();
            let entry = record.into_failure_entry(&self.policy, EVICTED_ERROR.to_string());
            self.emitter.emit(entry, context_id, page_url);
        }
    }

    fn on_request(&mut self, key: &SessionKey, e: RequestWillBeSent) {
        let request = e.request;
        let seen = RequestSeen {
            url: request.url.unwrap_or_default(),
            method: request.method,
            document_url: e.document_url,
            frame_id: e.frame_id,
            body: request.post_data,
            headers: request.headers.as_ref().and_then(HeaderBatch::from_value),
            restart: e.redirect_response.is_some(),
        };

        let (session, _) = self.sessions.ensure(key);
        let target_url = session.target_url.clone();
        if session.ledger.request_seen(&e.request_id, seen) {
            if let Some(record) = session.ledger.get_mut(&e.request_id) {
                record.page_hint = target_url;
            }
        }
    }
}

/// Pull the full body of a finished response from the owning session. A
/// refusal (evicted, opaque or oversized bodies) yields an empty body rather
/// than an error.
async fn fetch_body(
    host: &dyn DebuggerHost,
    policy: &BodyPolicy,
    key: &SessionKey,
    request_id: &str,
) -> ReconstructedBody {
    let command = GetResponseBody {
        request_id: request_id.to_string(),
    };
    match commands::send(host, &key.target(), &command).await {
        Ok(reply) => match serde_json::from_value::<ResponseBody>(reply) {
            Ok(reply) => policy.from_fetched(reply.body, reply.base64_encoded),
            Err(e) => {
                debug!("Unreadable body reply for {}: {}", request_id, e);
                ReconstructedBody::unavailable()
            }
        },
        Err(e) => {
            debug!("Body for {} unavailable: {}", request_id, e);
            ReconstructedBody::unavailable()
        }
    }
}

impl std::fmt::Debug for ProtocolCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolCapture")
            .field("attached_tabs", &self.attached_tabs)
            .field("sessions", &self.sessions.len())
            .field("listening", &self.listening)
            .finish()
    }
}
