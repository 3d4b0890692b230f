//! Outbound side of the capture subsystem.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::capture::host::ContextId;
use crate::entry::CaptureEntry;

/// Receiver of finished transactions. Called exactly once per emitted
/// transaction, synchronously, from inside the event handler that finalized it.
#[cfg_attr(test, mockall::automock)]
pub trait EntrySink: Send + Sync {
    fn on_entry(&self, entry: CaptureEntry, context_id: Option<ContextId>, page_url: Option<String>);
}

impl<F> EntrySink for F
where
    F: Fn(CaptureEntry, Option<ContextId>, Option<String>) + Send + Sync,
{
    fn on_entry(&self, entry: CaptureEntry, context_id: Option<ContextId>, page_url: Option<String>) {
        self(entry, context_id, page_url)
    }
}

/// An entry together with the routing information handed to the sink.
#[derive(Debug, Clone)]
pub struct CapturedEntry {
    pub entry: CaptureEntry,
    pub context_id: Option<ContextId>,
    pub page_url: Option<String>,
}

/// Forwards entries to an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<CapturedEntry>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CapturedEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EntrySink for ChannelSink {
    fn on_entry(&self, entry: CaptureEntry, context_id: Option<ContextId>, page_url: Option<String>) {
        let captured = CapturedEntry {
            entry,
            context_id,
            page_url,
        };
        if self.tx.send(captured).is_err() {
            debug!("Entry receiver dropped; discarding entry");
        }
    }
}

/// Hands entries to the sink without letting a faulty consumer unwind into
/// the host's event dispatch.
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn EntrySink>,
    emitted: u64,
}

impl Emitter {
    pub fn new(sink: Arc<dyn EntrySink>) -> Self {
        Self { sink, emitted: 0 }
    }

    pub fn emit(&mut self, entry: CaptureEntry, context_id: Option<ContextId>, page_url: Option<String>) {
        debug!(
            "Emitting {} {} for context {:?}",
            entry.request.method, entry.request.url, context_id
        );
        self.emitted += 1;
        let sink = &self.sink;
        if catch_unwind(AssertUnwindSafe(|| sink.on_entry(entry, context_id, page_url))).is_err() {
            warn!("Entry sink panicked; continuing with the next event");
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter").field("emitted", &self.emitted).finish()
    }
}
