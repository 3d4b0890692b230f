use serde::{Deserialize, Serialize};

use crate::headers::HeaderMap;

/// One finished network transaction, the only artifact the capture subsystem emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureEntry {
    pub meta: EntryMeta,
    pub request: RequestSide,
    pub response: ResponseSide,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMeta {
    /// Milliseconds since the Unix epoch at which the request was first seen.
    pub timestamp: i64,
    pub browsing_context_id: Option<i64>,
    pub page_url: Option<String>,
    pub frame_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    #[default]
    None,
    Text,
    Base64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSide {
    pub url: String,
    pub method: String,
    pub headers: HeaderMap,
    pub body: Option<String>,
    pub body_encoding: BodyEncoding,
    pub body_size: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseSide {
    Success(ResponseSuccess),
    Failure(ResponseFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSuccess {
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Option<String>,
    pub body_encoding: BodyEncoding,
    pub body_size: usize,
    pub truncated: bool,
    pub served_from_cache: bool,
    pub from_service_worker: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFailure {
    pub network_error: String,
}

impl CaptureEntry {
    pub fn is_failure(&self) -> bool {
        matches!(self.response, ResponseSide::Failure(_))
    }

    pub fn success(&self) -> Option<&ResponseSuccess> {
        match &self.response {
            ResponseSide::Success(response) => Some(response),
            ResponseSide::Failure(_) => None,
        }
    }

    pub fn network_error(&self) -> Option<&str> {
        match &self.response {
            ResponseSide::Failure(failure) => Some(failure.network_error.as_str()),
            ResponseSide::Success(_) => None,
        }
    }

    /// Request plus response body sizes, as counted by run statistics.
    pub fn total_body_bytes(&self) -> usize {
        self.request.body_size + self.success().map(|r| r.body_size).unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
