//! Transport seams implemented by concrete network bindings
//!
//! The nodes in this crate are transport agnostic: web socket, HTTP or
//! in-process bindings implement one of these traits and forward inbound
//! traffic to the node's callback methods.

use crate::error::NodeError;
use crate::message::MessageDto;

/// Client side of a full-duplex transport
///
/// The binding must call back into
/// [`AsyncClientNode`](crate::client_async::AsyncClientNode) (`on_open`,
/// `on_message`, `on_close`, `on_error`) as the transport reports progress.
pub trait AsyncClientEndpoint: Send + Sync {
    /// Open a transport session
    fn open_session(&self, session_id: &str) -> Result<(), NodeError>;

    /// Send a message over an open session
    fn send_message(&self, message: &MessageDto) -> Result<(), NodeError>;

    /// Close a transport session
    fn close_session(&self, session_id: &str) -> Result<(), NodeError>;
}

/// Server side of a full-duplex transport
pub trait AsyncServerEndpoint: Send + Sync {
    /// Push a message to the client of its session
    fn send_message(&self, message: &MessageDto) -> Result<(), NodeError>;
}

/// Client side of a request/response transport
///
/// One call carries one request and returns every message the server has
/// pending for it: the paired response and any queued events.
pub trait SyncClientEndpoint: Send + Sync {
    /// Send a request and collect the server's pending messages
    fn send_request(&self, message: &MessageDto) -> Result<Vec<MessageDto>, NodeError>;
}

/// Consumer of inbound messages on the serving side
pub trait MessageHandler: Send + Sync {
    /// Handle one message, optionally producing the paired response
    fn on_message(&self, message: MessageDto) -> Result<Option<MessageDto>, NodeError>;
}

impl<F> MessageHandler for F
where
    F: Fn(MessageDto) -> Result<Option<MessageDto>, NodeError> + Send + Sync,
{
    fn on_message(&self, message: MessageDto) -> Result<Option<MessageDto>, NodeError> {
        self(message)
    }
}
