//! Client node for full-duplex transports
//!
//! Each request runs through the open → send → close handshake, blocking
//! the calling thread on the session condvar at every step. The transport
//! binding reports progress through the `on_*` callbacks; server-pushed
//! reader and plugin events bypass the session machinery and land on an
//! event channel.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, warn};

use crate::endpoint::AsyncClientEndpoint;
use crate::error::NodeError;
use crate::message::{Action, MessageDto};
use crate::node::{NodeConfig, SessionMap, generate_id};
use crate::session::SessionState;

/// Client node over an [`AsyncClientEndpoint`]
pub struct AsyncClientNode<E: AsyncClientEndpoint> {
    node_id: String,
    endpoint: E,
    config: NodeConfig,
    sessions: SessionMap,
    event_tx: Sender<MessageDto>,
    event_rx: Receiver<MessageDto>,
}

impl<E: AsyncClientEndpoint> AsyncClientNode<E> {
    /// Create a node around an endpoint
    pub fn new(endpoint: E, config: NodeConfig) -> Self {
        let (event_tx, event_rx) = unbounded();
        Self {
            node_id: generate_id(),
            endpoint,
            config,
            sessions: SessionMap::new(),
            event_tx,
            event_rx,
        }
    }

    /// Id of this node
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Channel carrying server-pushed reader and plugin events
    pub fn events(&self) -> Receiver<MessageDto> {
        self.event_rx.clone()
    }

    /// Send a request and block until its paired response arrives
    ///
    /// Runs the full session lifecycle: open the transport session, send,
    /// wait for the response, close. Any failure or timeout aborts exactly
    /// this session and removes it from the map.
    pub fn send_request(&self, mut message: MessageDto) -> Result<MessageDto, NodeError> {
        if message.session_id.is_empty() {
            message.session_id = generate_id();
        }
        message.client_node_id = self.node_id.clone();
        let session_id = message.session_id.clone();
        let session = self.sessions.create(&session_id)?;

        let result = (|| {
            session.set_state(SessionState::OpenBegin);
            self.endpoint.open_session(&session_id)?;
            session.wait_for(SessionState::OpenEnd, self.config.request_timeout)?;

            session.set_state(SessionState::SendRequestBegin);
            self.endpoint.send_message(&message)?;
            let response = session
                .wait_for(SessionState::SendRequestEnd, self.config.request_timeout)?
                .ok_or(NodeError::InvalidMessage("response without payload"))?;

            session.set_state(SessionState::CloseBegin);
            self.endpoint.close_session(&session_id)?;
            session.wait_for(SessionState::CloseEnd, self.config.request_timeout)?;

            Ok(response)
        })();

        // Win or lose, the session id is spent
        self.sessions.remove(&session_id);
        result
    }

    /// Send a one-way message over an already-open session
    pub fn send_message(&self, mut message: MessageDto) -> Result<(), NodeError> {
        message.client_node_id = self.node_id.clone();
        let session = self.sessions.get(&message.session_id)?;
        session.set_state(SessionState::SendMessage);
        self.endpoint.send_message(&message)
    }

    /// Transport callback: the session finished opening
    pub fn on_open(&self, session_id: &str) {
        match self.sessions.get(session_id) {
            Ok(session) => {
                session.deliver(SessionState::OpenBegin, SessionState::OpenEnd, None);
            }
            Err(_) => warn!(session = %session_id, "Open confirmation for unknown session"),
        }
    }

    /// Transport callback: a message arrived
    ///
    /// Error messages abort their session; reader and plugin events go to
    /// the event channel; everything else is delivered as the pending
    /// response of its session.
    pub fn on_message(&self, message: MessageDto) {
        match message.action {
            Action::Error => {
                let error = message
                    .error_body()
                    .map_or(NodeError::InvalidMessage("undecodable error body"), Into::into);
                if let Ok(session) = self.sessions.get(&message.session_id) {
                    session.fail(error);
                } else {
                    warn!(session = %message.session_id, "Error for unknown session");
                }
            }
            Action::ReaderEvent | Action::PluginEvent => {
                if self.event_tx.send(message).is_err() {
                    warn!("Event receiver dropped, discarding server event");
                }
            }
            _ => match self.sessions.get(&message.session_id) {
                Ok(session) => {
                    session.deliver(
                        SessionState::SendRequestBegin,
                        SessionState::SendRequestEnd,
                        Some(message),
                    );
                }
                Err(_) => {
                    warn!(session = %message.session_id, "Response for unknown session, discarding");
                }
            },
        }
    }

    /// Transport callback: the session finished closing
    pub fn on_close(&self, session_id: &str) {
        if let Ok(session) = self.sessions.get(session_id) {
            session.deliver(SessionState::CloseBegin, SessionState::CloseEnd, None);
        }
    }

    /// Transport callback: the transport failed for one session
    pub fn on_error(&self, session_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(session = %session_id, %reason, "Transport error reported");
        if let Ok(session) = self.sessions.get(session_id) {
            session.fail(NodeError::Aborted {
                session_id: session_id.to_owned(),
                reason,
            });
        }
    }

    /// Bound applied to every session wait
    pub const fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }
}

impl<E: AsyncClientEndpoint> std::fmt::Debug for AsyncClientNode<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncClientNode")
            .field("node_id", &self.node_id)
            .finish()
    }
}
