//! Wire message exchanged between remote nodes
//!
//! Every exchange travels as a [`MessageDto`]: a session id, an action tag,
//! the node ids of both ends and an opaque JSON body. All fields are
//! mandatory except the server node id on first contact (the client does
//! not know it yet).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NodeError;

/// Action tag of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// A reader event pushed from server to client
    ReaderEvent,
    /// A plugin event pushed from server to client
    PluginEvent,
    /// A transmission request or its response
    ReaderTransmit,
    /// Registration of a default selection on the remote reader
    DefaultSelectionRequest,
    /// Client polling for pending plugin events (sync transport)
    CheckPluginEvent,
    /// Client polling for pending reader events (sync transport)
    CheckReaderEvent,
    /// An error report; the body carries an [`ErrorBody`]
    Error,
}

/// Error taxonomy carried in the body of [`Action::Error`] messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The client-side task waiting for a response timed out
    TimeoutClientTask,
    /// The server-side task waiting for the client timed out
    TimeoutServerTask,
    /// Any other failure
    Unknown,
}

/// Body payload of an error message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error classification
    pub code: ErrorCode,
    /// Human-readable detail
    pub message: String,
}

/// One message of the remote protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDto {
    /// Session this message belongs to
    pub session_id: String,
    /// What the message carries
    pub action: Action,
    /// Id of the client node
    pub client_node_id: String,
    /// Id of the server node; absent on first contact only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_node_id: Option<String>,
    /// Opaque structured payload
    pub body: Value,
}

impl MessageDto {
    /// Create a message with an empty body
    pub fn new(
        action: Action,
        session_id: impl Into<String>,
        client_node_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            action,
            client_node_id: client_node_id.into(),
            server_node_id: None,
            body: Value::Null,
        }
    }

    /// Set the server node id
    pub fn with_server_node_id(mut self, server_node_id: impl Into<String>) -> Self {
        self.server_node_id = Some(server_node_id.into());
        self
    }

    /// Set the body payload
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Build an error message answering this one
    pub fn error_reply(&self, code: ErrorCode, message: impl Into<String>) -> Self {
        let body = ErrorBody {
            code,
            message: message.into(),
        };
        Self {
            session_id: self.session_id.clone(),
            action: Action::Error,
            client_node_id: self.client_node_id.clone(),
            server_node_id: self.server_node_id.clone(),
            body: serde_json::to_value(body).unwrap_or(Value::Null),
        }
    }

    /// Decode the error body of an [`Action::Error`] message
    pub fn error_body(&self) -> Option<ErrorBody> {
        if self.action != Action::Error {
            return None;
        }
        serde_json::from_value(self.body.clone()).ok()
    }

    /// Validate mandatory fields
    ///
    /// `first_contact` relaxes the server node id requirement.
    pub fn validate(&self, first_contact: bool) -> Result<(), NodeError> {
        if self.session_id.is_empty() {
            return Err(NodeError::InvalidMessage("empty session id"));
        }
        if self.client_node_id.is_empty() {
            return Err(NodeError::InvalidMessage("empty client node id"));
        }
        if !first_contact && self.server_node_id.as_deref().is_none_or(str::is_empty) {
            return Err(NodeError::InvalidMessage("missing server node id"));
        }
        Ok(())
    }
}
