//! Server node for full-duplex transports
//!
//! Inbound messages are validated, mapped to their session and handed to
//! the [`MessageHandler`]; the handler's reply travels back through the
//! endpoint tagged with this node's id. A handler failure is reported to
//! the client as an error message on the same session, never by tearing
//! the node down.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::endpoint::{AsyncServerEndpoint, MessageHandler};
use crate::error::NodeError;
use crate::message::{Action, MessageDto};
use crate::node::generate_id;

/// Server node over an [`AsyncServerEndpoint`]
pub struct AsyncServerNode<E: AsyncServerEndpoint, H: MessageHandler> {
    node_id: String,
    endpoint: E,
    handler: H,
    // session id -> client node id of the session opener
    sessions: Mutex<HashMap<String, String>>,
}

impl<E: AsyncServerEndpoint, H: MessageHandler> AsyncServerNode<E, H> {
    /// Create a node around an endpoint and a message handler
    pub fn new(endpoint: E, handler: H) -> Self {
        Self {
            node_id: generate_id(),
            endpoint,
            handler,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Id of this node
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Transport callback: a client opened a session
    pub fn on_open(&self, session_id: &str, client_node_id: &str) {
        debug!(session = %session_id, client = %client_node_id, "Session opened");
        self.sessions
            .lock()
            .insert(session_id.to_owned(), client_node_id.to_owned());
    }

    /// Transport callback: a client closed its session
    pub fn on_close(&self, session_id: &str) {
        debug!(session = %session_id, "Session closed");
        self.sessions.lock().remove(session_id);
    }

    /// Transport callback: a message arrived
    ///
    /// The handler's reply (if any) is sent back on the same session. A
    /// message referencing an unknown session is answered with an error
    /// instead of being processed.
    pub fn on_message(&self, message: MessageDto) {
        if let Err(e) = self.dispatch(message) {
            warn!(error = %e, "Failed to dispatch inbound message");
        }
    }

    fn dispatch(&self, message: MessageDto) -> Result<(), NodeError> {
        message.validate(true)?;

        if !self.sessions.lock().contains_key(&message.session_id) {
            let error = NodeError::ClosedSession {
                session_id: message.session_id.clone(),
            };
            let reply = message
                .error_reply(error.error_code(), error.to_string())
                .with_server_node_id(self.node_id.clone());
            return self.endpoint.send_message(&reply);
        }

        match self.handler.on_message(message.clone()) {
            Ok(Some(reply)) => {
                let reply = reply.with_server_node_id(self.node_id.clone());
                self.endpoint.send_message(&reply)
            }
            Ok(None) => Ok(()),
            Err(e) => {
                // The failure stays scoped to this session
                let reply = message
                    .error_reply(e.error_code(), e.to_string())
                    .with_server_node_id(self.node_id.clone());
                self.endpoint.send_message(&reply)
            }
        }
    }

    /// Push an event to the client of a session
    pub fn send_event(
        &self,
        session_id: &str,
        action: Action,
        body: serde_json::Value,
    ) -> Result<(), NodeError> {
        let client_node_id = self
            .sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| NodeError::ClosedSession {
                session_id: session_id.to_owned(),
            })?;
        let message = MessageDto::new(action, session_id, client_node_id)
            .with_server_node_id(self.node_id.clone())
            .with_body(body);
        self.endpoint.send_message(&message)
    }
}

impl<E: AsyncServerEndpoint, H: MessageHandler> std::fmt::Debug for AsyncServerNode<E, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncServerNode")
            .field("node_id", &self.node_id)
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}
