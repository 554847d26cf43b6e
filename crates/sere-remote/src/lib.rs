//! Remote session synchronization for secure element readers
//!
//! This crate mirrors the request/response/event exchange of a reader
//! across a network boundary. A client node and a server node each run
//! independent tasks that must block-and-wait for a counterpart message
//! tagged by session id; the transport in between is pluggable and comes
//! in two flavors:
//!
//! - **Asynchronous** ([`AsyncClientEndpoint`]/[`AsyncServerEndpoint`]):
//!   full-duplex transports (web sockets and the like). Each session is a
//!   small state machine guarded by a mutex/condvar pair; the calling
//!   thread blocks on the session until the endpoint callback transitions
//!   it or a bounded timeout elapses.
//! - **Synchronous** ([`SyncClientEndpoint`]): request/response transports
//!   (HTTP-style). Server-push events are emulated with short-interval
//!   polling or long polling, backed server-side by a sendbox of pending
//!   messages with parked poll workers and a timestamp registry swept on
//!   insert.
//!
//! Failures are session-scoped: an error or timeout cancels exactly the
//! session it belongs to, and a stale response can never reach a waiter
//! that already timed out.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod backoff;
pub mod client_async;
pub mod client_sync;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod node;
pub mod server_async;
pub mod server_sync;
pub mod session;

pub use backoff::FibonacciBackoff;
pub use client_async::AsyncClientNode;
pub use client_sync::{EventStrategy, SyncClientNode};
pub use endpoint::{
    AsyncClientEndpoint, AsyncServerEndpoint, MessageHandler, SyncClientEndpoint,
};
pub use error::NodeError;
pub use message::{Action, ErrorBody, ErrorCode, MessageDto};
pub use node::NodeConfig;
pub use server_async::AsyncServerNode;
pub use server_sync::SyncServerNode;
pub use session::{Session, SessionState};
