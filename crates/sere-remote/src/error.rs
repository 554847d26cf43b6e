//! Error types of the remote session layer
//!
//! Every error is scoped to the session (or client) it concerns; a failure
//! never cancels an unrelated session.

use crate::message::{ErrorBody, ErrorCode};

/// Errors raised by remote nodes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    /// A session wait exceeded its bound
    #[error("Session {session_id} timed out waiting for the remote task")]
    Timeout {
        /// The session that timed out
        session_id: String,
    },

    /// The server found no active poll worker for a client it must reach
    #[error("Event delivery to client {client_node_id} timed out")]
    ServerTimeout {
        /// The unreachable client
        client_node_id: String,
    },

    /// A message referenced an unknown or already-closed session
    #[error("Unknown or closed session {session_id}")]
    ClosedSession {
        /// The unresolvable session id
        session_id: String,
    },

    /// The session was aborted by an asynchronous failure
    #[error("Session {session_id} aborted: {reason}")]
    Aborted {
        /// The aborted session
        session_id: String,
        /// What went wrong
        reason: String,
    },

    /// The transport binding failed
    #[error("Transport failure: {0}")]
    Transport(String),

    /// A message failed validation
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    /// The peer reported an error
    #[error("Remote error {code:?}: {message}")]
    Remote {
        /// Error classification from the peer
        code: ErrorCode,
        /// Detail from the peer
        message: String,
    },
}

impl NodeError {
    /// The wire code this error travels under
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::TimeoutClientTask,
            Self::ServerTimeout { .. } => ErrorCode::TimeoutServerTask,
            Self::Remote { code, .. } => *code,
            _ => ErrorCode::Unknown,
        }
    }
}

impl From<ErrorBody> for NodeError {
    fn from(body: ErrorBody) -> Self {
        Self::Remote {
            code: body.code,
            message: body.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let timeout = NodeError::Timeout {
            session_id: "s".into(),
        };
        assert_eq!(timeout.error_code(), ErrorCode::TimeoutClientTask);

        let server = NodeError::ServerTimeout {
            client_node_id: "c".into(),
        };
        assert_eq!(server.error_code(), ErrorCode::TimeoutServerTask);

        let other = NodeError::Transport("boom".into());
        assert_eq!(other.error_code(), ErrorCode::Unknown);
    }
}
