//! Host platform seams.
//!
//! The browser is an opaque event source. The protocol backend talks to it
//! through [`DebuggerHost`] (attach, detach and scoped commands), the
//! webRequest backend through [`WebRequestHost`] (listener registration and
//! response filters). Exactly one of the two is used per host.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::Result;

/// Browsing context identifier assigned by the host (a tab id).
pub type ContextId = i64;

/// Where a protocol command is sent: a tab, optionally narrowed to one of its
/// flattened child sessions (iframe, worker).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandTarget {
    pub tab_id: ContextId,
    pub session_id: Option<String>,
}

impl CommandTarget {
    pub fn tab(tab_id: ContextId) -> Self {
        Self {
            tab_id,
            session_id: None,
        }
    }

    pub fn session(tab_id: ContextId, session_id: impl Into<String>) -> Self {
        Self {
            tab_id,
            session_id: Some(session_id.into()),
        }
    }
}

/// Debugger-style host (Chromium family).
#[async_trait]
pub trait DebuggerHost: Send + Sync {
    /// Attach the debugger to a tab. Fails when another client already holds
    /// it or permission is denied.
    async fn attach(&self, tab_id: ContextId, protocol_version: &str) -> Result<()>;

    async fn detach(&self, tab_id: ContextId) -> Result<()>;

    /// Send one protocol command and wait for its result.
    async fn send_command(&self, target: &CommandTarget, method: &str, params: Value) -> Result<Value>;
}

/// webRequest-style host (Gecko family).
pub trait WebRequestHost: Send + Sync {
    /// Whether `filter_response_data` is available at all.
    fn supports_response_filter(&self) -> bool;

    fn add_listeners(&self) -> Result<()>;

    fn remove_listeners(&self);

    /// Attach a streaming filter to a response. Only valid while handling the
    /// headers-received notification for `request_id`.
    fn filter_response_data(&self, request_id: &str) -> Result<Box<dyn ResponseFilter>>;
}

/// Host side of a streaming response filter.
pub trait ResponseFilter: Send {
    /// Forward a chunk to the page unchanged.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Release the filter. Must be safe to call after the stream ended.
    fn disconnect(&mut self);
}

/// What the host offers, as seen by the backend selector.
#[derive(Clone, Default)]
pub struct HostCapabilities {
    pub debugger: Option<Arc<dyn DebuggerHost>>,
    pub web_request: Option<Arc<dyn WebRequestHost>>,
}

impl HostCapabilities {
    pub fn with_web_request(web_request: Arc<dyn WebRequestHost>) -> Self {
        Self {
            debugger: None,
            web_request: Some(web_request),
        }
    }

    pub fn has_debugger(&self) -> bool {
        self.debugger.is_some()
    }

    pub fn has_streaming_web_request(&self) -> bool {
        self.web_request
            .as_ref()
            .map(|host| host.supports_response_filter())
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for HostCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCapabilities")
            .field("debugger", &self.has_debugger())
            .field("streaming_web_request", &self.has_streaming_web_request())
            .finish()
    }
}
