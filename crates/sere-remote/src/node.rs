//! Shared node plumbing: configuration, ids and the session map

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::NodeError;
use crate::session::Session;

/// Timing configuration of a node
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    /// Bound on every blocking session wait
    pub request_timeout: Duration,
    /// Age after which an idle sendbox entry is swept (sync server)
    pub sweep_age: Duration,
    /// First step of the event-loop retry backoff (sync client)
    pub retry_base: Duration,
    /// Cap on the event-loop retry backoff (sync client)
    pub retry_cap: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            sweep_age: Duration::from_secs(60),
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30),
        }
    }
}

impl NodeConfig {
    /// Create a default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session wait bound
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the sendbox sweep age
    pub const fn with_sweep_age(mut self, age: Duration) -> Self {
        self.sweep_age = age;
        self
    }

    /// Set the event-loop retry backoff bounds
    pub const fn with_retry_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.retry_base = base;
        self.retry_cap = cap;
        self
    }
}

/// Generate a fresh node or session id
pub(crate) fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Map of live sessions, keyed by session id
///
/// One manager exists per session id; a session leaves the map on close,
/// error or timeout and is never resurrected.
#[derive(Debug, Default)]
pub(crate) struct SessionMap {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create and register a session; fails when the id is already live
    pub(crate) fn create(&self, session_id: &str) -> Result<Arc<Session>, NodeError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(session_id) {
            return Err(NodeError::InvalidMessage("duplicate session id"));
        }
        let session = Arc::new(Session::new(session_id));
        sessions.insert(session_id.to_owned(), Arc::clone(&session));
        Ok(session)
    }

    /// Look up a live session
    pub(crate) fn get(&self, session_id: &str) -> Result<Arc<Session>, NodeError> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| NodeError::ClosedSession {
                session_id: session_id.to_owned(),
            })
    }

    /// Remove a session from the map
    pub(crate) fn remove(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().len()
    }
}
