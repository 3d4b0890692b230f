//! Protocol commands the capture backend sends to a debugger host

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capture::host::{CommandTarget, DebuggerHost};
use crate::Result;

// Macro to implement Command for parameter structs that serialize directly
macro_rules! impl_command {
    ($type_name:ty, $method:expr) => {
        impl Command for $type_name {
            fn method(&self) -> &'static str {
                $method
            }

            fn params(&self) -> Result<Value> {
                Ok(serde_json::to_value(self)?)
            }
        }
    };
}

/// Base trait for all protocol commands
pub trait Command: std::fmt::Debug + Send + Sync {
    fn method(&self) -> &'static str;
    fn params(&self) -> Result<Value>;
}

/// Start network observation for a tab or child session
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkEnable {}

/// Automatically attach to child targets (iframes, workers) as flat sessions
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAutoAttach {
    pub auto_attach: bool,
    pub wait_for_debugger_on_start: bool,
    pub flatten: bool,
}

impl Default for SetAutoAttach {
    fn default() -> Self {
        Self {
            auto_attach: true,
            wait_for_debugger_on_start: false,
            flatten: true,
        }
    }
}

/// Pull the complete body of a finished response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResponseBody {
    pub request_id: String,
}

/// Reply to [`GetResponseBody`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub base64_encoded: bool,
}

impl_command!(NetworkEnable, "Network.enable");
impl_command!(SetAutoAttach, "Target.setAutoAttach");
impl_command!(GetResponseBody, "Network.getResponseBody");

/// Serialize and send a command, returning the raw result.
pub async fn send<C: Command>(host: &dyn DebuggerHost, target: &CommandTarget, command: &C) -> Result<Value> {
    let params = command.params()?;
    host.send_command(target, command.method(), params).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_methods() {
        assert_eq!(NetworkEnable::default().method(), "Network.enable");
        assert_eq!(SetAutoAttach::default().method(), "Target.setAutoAttach");
        let body = GetResponseBody {
            request_id: "1000.1".to_string(),
        };
        assert_eq!(body.method(), "Network.getResponseBody");
    }

    #[test]
    fn test_command_params() {
        assert_eq!(NetworkEnable::default().params().unwrap(), json!({}));
        assert_eq!(
            SetAutoAttach::default().params().unwrap(),
            json!({"autoAttach": true, "waitForDebuggerOnStart": false, "flatten": true})
        );
        let body = GetResponseBody {
            request_id: "42".to_string(),
        };
        assert_eq!(body.params().unwrap(), json!({"requestId": "42"}));
    }

    #[test]
    fn test_response_body_defaults() {
        let parsed: ResponseBody = serde_json::from_value(json!({})).unwrap();
        assert!(parsed.body.is_none());
        assert!(!parsed.base64_encoded);

        let parsed: ResponseBody =
            serde_json::from_value(json!({"body": "aGk=", "base64Encoded": true})).unwrap();
        assert_eq!(parsed.body.as_deref(), Some("aGk="));
        assert!(parsed.base64_encoded);
    }
}
