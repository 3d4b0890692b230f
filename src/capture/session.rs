//! Session registry for the protocol backend.
//!
//! Every tracked browsing context (the tab's main target and each flattened
//! child target such as an iframe or worker) owns its own ledger. Sessions
//! are created lazily and never merged.

use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::capture::host::{CommandTarget, ContextId};
use crate::capture::ledger::{Ledger, LedgerLimits, RequestRecord};

/// Owner identity of a session: tab plus optional child session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub tab_id: ContextId,
    pub session_id: Option<String>,
}

impl SessionKey {
    pub fn main(tab_id: ContextId) -> Self {
        Self {
            tab_id,
            session_id: None,
        }
    }

    pub fn child(tab_id: ContextId, session_id: impl Into<String>) -> Self {
        Self {
            tab_id,
            session_id: Some(session_id.into()),
        }
    }

    /// Where commands scoped to this session are sent.
    pub fn target(&self) -> CommandTarget {
        CommandTarget {
            tab_id: self.tab_id,
            session_id: self.session_id.clone(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session_id {
            Some(session_id) => write!(f, "{}:{}", self.tab_id, session_id),
            None => write!(f, "main:{}", self.tab_id),
        }
    }
}

#[derive(Debug)]
pub struct Session {
    pub key: SessionKey,
    pub ledger: Ledger,
    /// Url of the attached target, when the host reported one.
    pub target_url: Option<String>,
}

impl Session {
    fn new(key: SessionKey, limits: LedgerLimits) -> Self {
        let ledger = Ledger::new(Some(key.tab_id), limits);
        Self {
            key,
            ledger,
            target_url: None,
        }
    }
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SessionKey, Session>,
    limits: LedgerLimits,
}

impl SessionRegistry {
    pub fn new(limits: LedgerLimits) -> Self {
        Self {
            sessions: HashMap::new(),
            limits,
        }
    }

    /// Fetch the session for `key`, creating it if needed. The flag reports
    /// whether it was just created.
    pub fn ensure(&mut self, key: &SessionKey) -> (&mut Session, bool) {
        let limits = self.limits;
        let mut created = false;
        let session = self.sessions.entry(key.clone()).or_insert_with(|| {
            debug!("Tracking session {}", key);
            created = true;
            Session::new(key.clone(), limits)
        });
        (session, created)
    }

    pub fn get(&self, key: &SessionKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &SessionKey) -> Option<&mut Session> {
        self.sessions.get_mut(key)
    }

    pub fn remove(&mut self, key: &SessionKey) -> Option<Session> {
        self.sessions.remove(key)
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Records evicted from any session's ledger since the last call.
    pub fn drain_evicted(&mut self) -> Vec<(String, RequestRecord)> {
        self.sessions
            .values_mut()
            .flat_map(|s| s.ledger.drain_evicted())
            .collect()
    }

    /// In-flight transactions across all sessions.
    pub fn pending(&self) -> usize {
        self.sessions.values().map(|s| s.ledger.len()).sum()
    }
}
