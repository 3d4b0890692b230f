use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::Result;

/// Default textual content-type sniff. An empty content type also counts as text.
pub const DEFAULT_TEXTUAL_CONTENT_TYPE: &str =
    r"(?i)^(text/|application/(json|xml|javascript|x-www-form-urlencoded))";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendPreference,
    pub protocol_version: String,
    pub auto_attach_targets: bool,
    pub textual_content_types: Vec<String>,
    pub max_body_bytes: Option<usize>,
    pub max_pending_requests: usize,
    pub stale_request_secs: u64,
    pub unknown_page_label: String,
    pub confdir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    Auto,
    Protocol,
    WebRequest,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            protocol_version: "1.3".to_string(),
            auto_attach_targets: true,
            textual_content_types: vec![DEFAULT_TEXTUAL_CONTENT_TYPE.to_string()],
            max_body_bytes: None,
            max_pending_requests: 4096,
            stale_request_secs: 0,
            unknown_page_label: "(unknown_page)".to_string(),
            confdir: "~/.deepcapture-rs".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// How long a transaction may stay in a ledger before it is evicted.
    /// Zero disables age based eviction.
    pub fn stale_after(&self) -> Option<Duration> {
        if self.stale_request_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.stale_request_secs))
        }
    }

    pub fn expand_path(&self, path: &str) -> String {
        if path.starts_with('~') {
            if let Some(home) = dirs::home_dir() {
                return path.replacen('~', &home.to_string_lossy(), 1);
            }
        }
        path.to_string()
    }

    pub fn confdir(&self) -> String {
        self.expand_path(&self.confdir)
    }
}
