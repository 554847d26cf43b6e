//! Per-session state machine with blocking waiters
//!
//! A [`Session`] pairs a tagged state with a mutex/condvar so a calling
//! thread can block until the counterpart's callback transitions the state
//! to the expected target or a bounded timeout elapses. Delivery is
//! guarded: a callback only succeeds when the session currently sits in
//! the matching `*Begin` state, so a response arriving after a timeout is
//! discarded instead of reaching a later waiter of the same id.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::error::NodeError;
use crate::message::MessageDto;

/// States of a remote session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session created, nothing sent yet
    Initialized,
    /// Waiting for the transport to confirm the open
    OpenBegin,
    /// Open confirmed
    OpenEnd,
    /// Request sent, waiting for the response
    SendRequestBegin,
    /// Response received
    SendRequestEnd,
    /// One-way message sent, no response expected
    SendMessage,
    /// An asynchronous error was attached
    ErrorReceived,
    /// Waiting for the transport to confirm the close
    CloseBegin,
    /// Close confirmed
    CloseEnd,
    /// Session terminated by timeout or error
    Aborted,
}

struct Inner {
    state: SessionState,
    response: Option<MessageDto>,
    error: Option<NodeError>,
}

/// One remote session owned by the node that created it
pub struct Session {
    id: String,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Session {
    /// Create a session in [`SessionState::Initialized`]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(Inner {
                state: SessionState::Initialized,
                response: None,
                error: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Session id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Move to a new state from the owning thread (no waiter involved)
    pub fn set_state(&self, state: SessionState) {
        let mut inner = self.inner.lock();
        trace!(session = %self.id, from = ?inner.state, to = ?state, "Session state set");
        inner.state = state;
        self.cond.notify_all();
    }

    /// Deliver a counterpart message, transitioning `expected` → `target`
    ///
    /// Returns false (and discards the message) when the session is not in
    /// the expected state anymore, e.g. because the waiter already timed
    /// out.
    pub fn deliver(
        &self,
        expected: SessionState,
        target: SessionState,
        message: Option<MessageDto>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != expected {
            warn!(
                session = %self.id,
                state = ?inner.state,
                ?expected,
                "Discarding stale delivery"
            );
            return false;
        }
        inner.state = target;
        inner.response = message;
        self.cond.notify_all();
        true
    }

    /// Attach an asynchronous error, waking exactly one waiter with it
    pub fn fail(&self, error: NodeError) {
        let mut inner = self.inner.lock();
        inner.state = SessionState::ErrorReceived;
        inner.error = Some(error);
        self.cond.notify_all();
    }

    /// Block until the session reaches `target` or the timeout elapses
    ///
    /// On timeout the session moves to [`SessionState::Aborted`] and a
    /// [`NodeError::Timeout`] is returned; an attached error is taken by
    /// exactly one waiter.
    pub fn wait_for(
        &self,
        target: SessionState,
        timeout: Duration,
    ) -> Result<Option<MessageDto>, NodeError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(error) = inner.error.take() {
                inner.state = SessionState::Aborted;
                return Err(error);
            }
            if inner.state == target {
                return Ok(inner.response.take());
            }
            let now = Instant::now();
            if now >= deadline {
                inner.state = SessionState::Aborted;
                return Err(NodeError::Timeout {
                    session_id: self.id.clone(),
                });
            }
            let _ = self.cond.wait_until(&mut inner, deadline);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}
