//! Capture runs.
//!
//! A [`Recorder`] groups emitted entries by page url and keeps running
//! totals while active. Stopping it yields a [`CaptureRun`] that a
//! [`RunStore`] can persist under its run key.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::entry::CaptureEntry;
use crate::sink::CapturedEntry;
use crate::{Error, Result};

pub const RUN_KEY_PREFIX: &str = "interceptorRun_";
const LAST_KEY_FILE: &str = "lastKey";

/// Live counters of the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub active: bool,
    pub started_at: i64,
    pub total_events: u64,
    pub pages_count: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub started_at: i64,
    pub stopped_at: i64,
    pub total_events: u64,
    pub pages_count: usize,
    pub total_bytes: u64,
}

/// A finished run: summary plus entries grouped by page url.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRun {
    pub id: Uuid,
    pub key: String,
    #[serde(flatten)]
    pub summary: RunSummary,
    pub dataset: IndexMap<String, Vec<CaptureEntry>>,
}

pub type UpdateCallback = Box<dyn Fn(&RunStatus) + Send + Sync>;

pub struct Recorder {
    active: bool,
    started_at: i64,
    dataset: IndexMap<String, Vec<CaptureEntry>>,
    total_events: u64,
    total_bytes: u64,
    unknown_page_label: String,
    on_update: Option<UpdateCallback>,
}

impl Recorder {
    pub fn new(config: &Config) -> Self {
        Self {
            active: false,
            started_at: 0,
            dataset: IndexMap::new(),
            total_events: 0,
            total_bytes: 0,
            unknown_page_label: config.unknown_page_label.clone(),
            on_update: None,
        }
    }

    /// Called with the fresh status after `start` and every ingested entry.
    pub fn on_update(mut self, callback: impl Fn(&RunStatus) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Box::new(callback));
        self
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Begin a new run. Starting an active recorder does nothing.
    pub fn start(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        self.started_at = chrono::Utc::now().timestamp_millis();
        self.dataset.clear();
        self.total_events = 0;
        self.total_bytes = 0;
        info!("Capture run started");
        self.notify();
    }

    /// Add one entry to the run. Ignored while inactive.
    pub fn ingest(&mut self, entry: CaptureEntry, page_url: Option<String>) {
        if !self.active {
            debug!("Recorder inactive; dropping {}", entry.request.url);
            return;
        }
        let page = page_url
            .or_else(|| entry.meta.page_url.clone())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.unknown_page_label.clone());

        self.total_events += 1;
        self.total_bytes += entry.total_body_bytes() as u64;
        self.dataset.entry(page).or_default().push(entry);
        self.notify();
    }

    pub fn ingest_captured(&mut self, captured: CapturedEntry) {
        self.ingest(captured.entry, captured.page_url);
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            active: self.active,
            started_at: self.started_at,
            total_events: self.total_events,
            pages_count: self.dataset.len(),
            total_bytes: self.total_bytes,
        }
    }

    /// Finish the run and hand over everything collected.
    pub fn stop(&mut self) -> Result<CaptureRun> {
        if !self.active {
            return Err(Error::Other("Recorder not active".to_string()));
        }
        self.active = false;

        let stopped_at = chrono::Utc::now().timestamp_millis();
        let summary = RunSummary {
            started_at: self.started_at,
            stopped_at,
            total_events: self.total_events,
            pages_count: self.dataset.len(),
            total_bytes: self.total_bytes,
        };
        info!(
            "Capture run stopped: {} events across {} pages, {} bytes",
            summary.total_events, summary.pages_count, summary.total_bytes
        );

        Ok(CaptureRun {
            id: Uuid::new_v4(),
            key: format!("{}{}", RUN_KEY_PREFIX, stopped_at),
            summary,
            dataset: std::mem::take(&mut self.dataset),
        })
    }

    fn notify(&self) {
        if let Some(callback) = &self.on_update {
            callback(&self.status());
        }
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder").field("status", &self.status()).finish()
    }
}

/// Finished runs saved as JSON files, one per run key.
#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Store under `<confdir>/runs`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(Path::new(&config.confdir()).join("runs"))
    }

    pub fn save(&self, run: &CaptureRun) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&run.key)?;
        std::fs::write(&path, serde_json::to_string(run)?)?;
        std::fs::write(self.dir.join(LAST_KEY_FILE), &run.key)?;
        debug!("Saved run {} to {}", run.key, path.display());
        Ok(path)
    }

    pub fn load(&self, key: &str) -> Result<CaptureRun> {
        let content = std::fs::read_to_string(self.path_for(key)?)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// The most recently saved run, falling back to the newest key on disk.
    pub fn latest(&self) -> Result<Option<CaptureRun>> {
        let last = std::fs::read_to_string(self.dir.join(LAST_KEY_FILE))
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| self.path_for(key).map(|p| p.exists()).unwrap_or(false));
        let key = match last {
            Some(key) => Some(key),
            None => self.keys()?.into_iter().next(),
        };
        key.map(|key| self.load(&key)).transpose()
    }

    /// Summaries of all stored runs, newest first.
    pub fn list(&self) -> Result<Vec<(String, RunSummary)>> {
        self.keys()?
            .into_iter()
            .map(|key| {
                let run = self.load(&key)?;
                Ok((key, run.summary))
            })
            .collect()
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        std::fs::remove_file(self.path_for(key)?)?;
        Ok(())
    }

    /// Stored run keys, newest first.
    fn keys(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys: Vec<(i64, String)> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            let Some(key) = name.strip_suffix(".json") else {
                continue;
            };
            if let Some(stamp) = key.strip_prefix(RUN_KEY_PREFIX).and_then(|s| s.parse().ok()) {
                keys.push((stamp, key.to_string()));
            }
        }
        keys.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(keys.into_iter().map(|(_, key)| key).collect())
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = key
            .strip_prefix(RUN_KEY_PREFIX)
            .map(|stamp| !stamp.is_empty() && stamp.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false);
        if !valid {
            return Err(Error::Other(format!("Invalid run key: {}", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{BodyEncoding, EntryMeta, RequestSide, ResponseSide, ResponseSuccess};
    use crate::headers::HeaderMap;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn entry(page: Option<&str>, request_size: usize, response_size: usize) -> CaptureEntry {
        CaptureEntry {
            meta: EntryMeta {
                timestamp: 1,
                browsing_context_id: Some(1),
                page_url: page.map(str::to_string),
                frame_id: None,
            },
            request: RequestSide {
                url: "https://a.test/api".to_string(),
                method: "POST".to_string(),
                headers: HeaderMap::new(),
                body: None,
                body_encoding: BodyEncoding::Text,
                body_size: request_size,
                truncated: false,
            },
            response: ResponseSide::Success(ResponseSuccess {
                status: 200,
                status_text: "OK".to_string(),
                headers: HeaderMap::new(),
                body: None,
                body_encoding: BodyEncoding::Text,
                body_size: response_size,
                truncated: false,
                served_from_cache: false,
                from_service_worker: false,
            }),
        }
    }

    #[test]
    fn test_groups_by_page_and_counts_bytes() {
        let mut recorder = Recorder::new(&Config::default());
        recorder.start();
        recorder.ingest(entry(Some("https://a.test/"), 3, 10), None);
        recorder.ingest(entry(None, 0, 5), Some("https://a.test/".to_string()));
        recorder.ingest(entry(None, 1, 1), None);

        let status = recorder.status();
        assert!(status.active);
        assert_eq!(status.total_events, 3);
        assert_eq!(status.pages_count, 2);
        assert_eq!(status.total_bytes, 20);

        let run = recorder.stop().unwrap();
        assert!(run.key.starts_with(RUN_KEY_PREFIX));
        assert_eq!(run.dataset["https://a.test/"].len(), 2);
        assert_eq!(run.dataset["(unknown_page)"].len(), 1);
        assert_eq!(run.summary.total_bytes, 20);
        assert!(!recorder.is_active());
    }

    #[test]
    fn test_stop_inactive_is_error() {
        let mut recorder = Recorder::new(&Config::default());
        assert!(recorder.stop().is_err());
        recorder.ingest(entry(None, 1, 1), None);
        assert_eq!(recorder.status().total_events, 0);
    }

    #[test]
    fn test_update_callback() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let seen = updates.clone();
        let mut recorder =
            Recorder::new(&Config::default()).on_update(move |status| seen.lock().unwrap().push(status.total_events));
        recorder.start();
        recorder.start();
        recorder.ingest(entry(None, 0, 0), None);

        assert_eq!(*updates.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_summary_json_shape() {
        let mut recorder = Recorder::new(&Config::default());
        recorder.start();
        let run = recorder.stop().unwrap();
        let value = serde_json::to_value(&run).unwrap();
        for field in ["startedAt", "stoppedAt", "totalEvents", "pagesCount", "totalBytes", "dataset", "key"] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
    }

    #[test]
    fn test_run_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        assert!(store.latest().unwrap().is_none());

        let mut recorder = Recorder::new(&Config::default());
        recorder.start();
        recorder.ingest(entry(Some("https://a.test/"), 2, 2), None);
        let mut run = recorder.stop().unwrap();
        run.key = format!("{}100", RUN_KEY_PREFIX);
        store.save(&run).unwrap();

        let mut older = run.clone();
        older.key = format!("{}50", RUN_KEY_PREFIX);
        store.save(&older).unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.key, older.key);

        let listed: Vec<String> = store.list().unwrap().into_iter().map(|(key, _)| key).collect();
        assert_eq!(listed, vec![run.key.clone(), older.key.clone()]);

        store.delete(&older.key).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().key, run.key);
        assert!(store.load("../etc/passwd").is_err());
    }
}
