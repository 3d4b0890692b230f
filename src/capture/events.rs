//! Events the host pushes into the capture subsystem
//!
//! Two families exist: protocol notifications from a debugger host, addressed
//! by method name with a JSON payload, and webRequest lifecycle callbacks
//! (plus response filter notifications) from a webRequest host.

use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capture::host::ContextId;
use crate::headers::HeaderPair;
use crate::{Error, Result};

/// Origin of a protocol notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebuggerSource {
    pub tab_id: Option<ContextId>,
    /// Flattened child session the notification belongs to, if any.
    #[serde(default)]
    pub session_id: Option<String>,
}

impl DebuggerSource {
    pub fn tab(tab_id: ContextId) -> Self {
        Self {
            tab_id: Some(tab_id),
            session_id: None,
        }
    }

    pub fn session(tab_id: ContextId, session_id: impl Into<String>) -> Self {
        Self {
            tab_id: Some(tab_id),
            session_id: Some(session_id.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default, rename = "type")]
    pub target_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedToTarget {
    pub session_id: String,
    #[serde(default)]
    pub target_info: TargetInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedFromTarget {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<Value>,
    #[serde(default)]
    pub post_data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestWillBeSent {
    pub request_id: String,
    #[serde(default)]
    pub request: RequestPayload,
    #[serde(default, rename = "documentURL")]
    pub document_url: Option<String>,
    #[serde(default)]
    pub frame_id: Option<String>,
    #[serde(default)]
    pub redirect_response: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraInfo {
    pub request_id: String,
    #[serde(default)]
    pub headers: Option<Value>,
    #[serde(default)]
    pub status_code: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub status_text: Option<String>,
    #[serde(default)]
    pub headers: Option<Value>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub from_service_worker: Option<bool>,
    #[serde(default)]
    pub timing: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceived {
    pub request_id: String,
    #[serde(default)]
    pub response: ResponsePayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestIdOnly {
    pub request_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFailed {
    pub request_id: String,
    #[serde(default)]
    pub error_text: Option<String>,
    #[serde(default)]
    pub canceled: Option<bool>,
}

/// A decoded protocol notification.
#[derive(Debug, Clone)]
pub enum CdpEvent {
    AttachedToTarget(AttachedToTarget),
    DetachedFromTarget(DetachedFromTarget),
    RequestWillBeSent(RequestWillBeSent),
    RequestWillBeSentExtraInfo(ExtraInfo),
    ResponseReceived(ResponseReceived),
    ResponseReceivedExtraInfo(ExtraInfo),
    RequestServedFromCache(RequestIdOnly),
    LoadingFinished(RequestIdOnly),
    LoadingFailed(LoadingFailed),
    Other(String),
}

impl CdpEvent {
    /// Decode a notification from its method name and payload. Methods the
    /// capture does not care about become [`CdpEvent::Other`].
    pub fn parse(method: &str, params: Value) -> Result<Self> {
        let event = match method {
            "Target.attachedToTarget" => CdpEvent::AttachedToTarget(decode(method, params)?),
            "Target.detachedFromTarget" => CdpEvent::DetachedFromTarget(decode(method, params)?),
            "Network.requestWillBeSent" => CdpEvent::RequestWillBeSent(decode(method, params)?),
            "Network.requestWillBeSentExtraInfo" => {
                CdpEvent::RequestWillBeSentExtraInfo(decode(method, params)?)
            }
            "Network.responseReceived" => CdpEvent::ResponseReceived(decode(method, params)?),
            "Network.responseReceivedExtraInfo" => {
                CdpEvent::ResponseReceivedExtraInfo(decode(method, params)?)
            }
            "Network.requestServedFromCache" => {
                CdpEvent::RequestServedFromCache(decode(method, params)?)
            }
            "Network.loadingFinished" => CdpEvent::LoadingFinished(decode(method, params)?),
            "Network.loadingFailed" => CdpEvent::LoadingFailed(decode(method, params)?),
            other => CdpEvent::Other(other.to_string()),
        };
        Ok(event)
    }

    pub fn event_name(&self) -> &str {
        match self {
            CdpEvent::AttachedToTarget(_) => "Target.attachedToTarget",
            CdpEvent::DetachedFromTarget(_) => "Target.detachedFromTarget",
            CdpEvent::RequestWillBeSent(_) => "Network.requestWillBeSent",
            CdpEvent::RequestWillBeSentExtraInfo(_) => "Network.requestWillBeSentExtraInfo",
            CdpEvent::ResponseReceived(_) => "Network.responseReceived",
            CdpEvent::ResponseReceivedExtraInfo(_) => "Network.responseReceivedExtraInfo",
            CdpEvent::RequestServedFromCache(_) => "Network.requestServedFromCache",
            CdpEvent::LoadingFinished(_) => "Network.loadingFinished",
            CdpEvent::LoadingFailed(_) => "Network.loadingFailed",
            CdpEvent::Other(method) => method.as_str(),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(method: &str, params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| Error::malformed_event(format!("{}: {}", method, e)))
}

/// Numeric status code from a loosely typed payload field.
pub fn status_code(value: Option<&Value>) -> Option<u16> {
    let value = value?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
        .and_then(|code| u16::try_from(code).ok())
}

/// One uploaded chunk of a raw request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadData {
    #[serde(default)]
    pub bytes: Option<Vec<u8>>,
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBodyDetails {
    #[serde(default)]
    pub form_data: Option<IndexMap<String, Vec<String>>>,
    #[serde(default)]
    pub raw: Option<Vec<UploadData>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The details object webRequest passes to every lifecycle listener. Each
/// notification fills a different subset of the fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRequestDetails {
    pub request_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub tab_id: Option<ContextId>,
    #[serde(default)]
    pub frame_id: Option<i64>,
    #[serde(default)]
    pub document_url: Option<String>,
    #[serde(default)]
    pub request_body: Option<RequestBodyDetails>,
    #[serde(default)]
    pub request_headers: Option<Vec<HeaderPair>>,
    #[serde(default)]
    pub response_headers: Option<Vec<HeaderPair>>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub status_line: Option<String>,
    #[serde(default)]
    pub from_cache: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WebRequestDetails {
    pub fn new(request_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            url: url.into(),
            ..Default::default()
        }
    }
}

/// webRequest lifecycle notifications plus response filter callbacks.
#[derive(Debug, Clone)]
pub enum WebRequestEvent {
    BeforeRequest(WebRequestDetails),
    BeforeSendHeaders(WebRequestDetails),
    HeadersReceived(WebRequestDetails),
    Completed(WebRequestDetails),
    ErrorOccurred(WebRequestDetails),
    FilterData { request_id: String, data: Bytes },
    FilterStop { request_id: String },
    FilterError { request_id: String, error: String },
}

impl WebRequestEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            WebRequestEvent::BeforeRequest(_) => "onBeforeRequest",
            WebRequestEvent::BeforeSendHeaders(_) => "onBeforeSendHeaders",
            WebRequestEvent::HeadersReceived(_) => "onHeadersReceived",
            WebRequestEvent::Completed(_) => "onCompleted",
            WebRequestEvent::ErrorOccurred(_) => "onErrorOccurred",
            WebRequestEvent::FilterData { .. } => "filter.ondata",
            WebRequestEvent::FilterStop { .. } => "filter.onstop",
            WebRequestEvent::FilterError { .. } => "filter.onerror",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            WebRequestEvent::BeforeRequest(d)
            | WebRequestEvent::BeforeSendHeaders(d)
            | WebRequestEvent::HeadersReceived(d)
            | WebRequestEvent::Completed(d)
            | WebRequestEvent::ErrorOccurred(d) => &d.request_id,
            WebRequestEvent::FilterData { request_id, .. }
            | WebRequestEvent::FilterStop { request_id }
            | WebRequestEvent::FilterError { request_id, .. } => request_id,
        }
    }

    /// Build a lifecycle event from its listener name.
    pub fn from_listener(listener: &str, details: WebRequestDetails) -> Result<Self> {
        let event = match listener {
            "onBeforeRequest" => WebRequestEvent::BeforeRequest(details),
            "onBeforeSendHeaders" => WebRequestEvent::BeforeSendHeaders(details),
            "onHeadersReceived" => WebRequestEvent::HeadersReceived(details),
            "onCompleted" => WebRequestEvent::Completed(details),
            "onErrorOccurred" => WebRequestEvent::ErrorOccurred(details),
            other => return Err(Error::malformed_event(format!("unknown webRequest listener {}", other))),
        };
        Ok(event)
    }
}

/// Protocol notification with its origin
#[derive(Debug, Clone)]
pub struct ProtocolEvent {
    pub source: DebuggerSource,
    pub event: CdpEvent,
}

/// Type-erased event that can hold either host family's notifications
#[derive(Debug, Clone)]
pub enum HostEvent {
    Protocol(ProtocolEvent),
    WebRequest(WebRequestEvent),
}

impl HostEvent {
    /// Decode a raw protocol notification.
    pub fn protocol(source: DebuggerSource, method: &str, params: Value) -> Result<Self> {
        Ok(HostEvent::Protocol(ProtocolEvent {
            source,
            event: CdpEvent::parse(method, params)?,
        }))
    }

    pub fn event_name(&self) -> &str {
        match self {
            HostEvent::Protocol(e) => e.event.event_name(),
            HostEvent::WebRequest(e) => e.event_name(),
        }
    }
}

macro_rules! impl_from_event {
    ($variant:ident, $type:ty) => {
        impl From<$type> for HostEvent {
            fn from(event: $type) -> Self {
                HostEvent::$variant(event)
            }
        }
    };
}

impl_from_event!(Protocol, ProtocolEvent);
impl_from_event!(WebRequest, WebRequestEvent);
