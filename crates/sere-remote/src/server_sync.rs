//! Server node for request/response transports
//!
//! A synchronous transport cannot push: the server parks pending outbound
//! messages in a sendbox keyed by client node id, and poll requests
//! (`CHECK_READER_EVENT`/`CHECK_PLUGIN_EVENT`) drain it. Long polling
//! parks the transport worker thread on the box condvar until an event
//! lands or its bound elapses. Each poll stamps the box with a timestamp;
//! boxes idle beyond the sweep age are removed opportunistically on the
//! next poll, so an abandoned client never leaks its queue, and an event
//! pushed to a swept client is reported as a server-task timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::endpoint::MessageHandler;
use crate::error::NodeError;
use crate::message::{Action, MessageDto};
use crate::node::{NodeConfig, generate_id};

// Poll body sent by the sync client's event loops.
#[derive(Debug, Deserialize)]
struct PollBody {
    strategy: PollStrategy,
    #[serde(default)]
    max_wait_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum PollStrategy {
    Polling,
    LongPolling,
}

struct BoxState {
    queue: Vec<MessageDto>,
    last_seen: Instant,
}

struct EventBox {
    state: Mutex<BoxState>,
    cond: Condvar,
}

/// Server node over a request/response transport
pub struct SyncServerNode<H: MessageHandler> {
    node_id: String,
    handler: H,
    config: NodeConfig,
    sendbox: Mutex<HashMap<String, Arc<EventBox>>>,
}

impl<H: MessageHandler> SyncServerNode<H> {
    /// Create a node around a message handler
    pub fn new(handler: H, config: NodeConfig) -> Self {
        Self {
            node_id: generate_id(),
            handler,
            config,
            sendbox: Mutex::new(HashMap::new()),
        }
    }

    /// Id of this node
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Entry point called by the transport binding for every client request
    ///
    /// Returns the messages to ship back in the same transport response:
    /// the paired reply of a regular request, or whatever events were
    /// pending (possibly none) for a poll request.
    pub fn on_request(&self, message: MessageDto) -> Result<Vec<MessageDto>, NodeError> {
        message.validate(true)?;

        match message.action {
            Action::CheckPluginEvent | Action::CheckReaderEvent => Ok(self.poll(&message)),
            _ => Ok(self.dispatch(message)),
        }
    }

    /// Queue an event for a client; its next poll picks it up
    ///
    /// Fails with a server-task timeout when the client has no live
    /// sendbox entry, i.e. it stopped polling longer ago than the sweep
    /// age.
    pub fn push_event(&self, client_node_id: &str, message: MessageDto) -> Result<(), NodeError> {
        let entry = self.sendbox.lock().get(client_node_id).cloned();
        let Some(entry) = entry else {
            return Err(NodeError::ServerTimeout {
                client_node_id: client_node_id.to_owned(),
            });
        };
        let mut state = entry.state.lock();
        state.queue.push(message);
        entry.cond.notify_all();
        Ok(())
    }

    fn dispatch(&self, message: MessageDto) -> Vec<MessageDto> {
        match self.handler.on_message(message.clone()) {
            Ok(Some(reply)) => vec![reply.with_server_node_id(self.node_id.clone())],
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(session = %message.session_id, error = %e, "Handler failed");
                vec![
                    message
                        .error_reply(e.error_code(), e.to_string())
                        .with_server_node_id(self.node_id.clone()),
                ]
            }
        }
    }

    fn poll(&self, message: &MessageDto) -> Vec<MessageDto> {
        let body: PollBody = match serde_json::from_value(message.body.clone()) {
            Ok(body) => body,
            Err(_) => PollBody {
                strategy: PollStrategy::Polling,
                max_wait_secs: 0,
            },
        };

        let entry = self.touch(&message.client_node_id);
        let mut state = entry.state.lock();

        if body.strategy == PollStrategy::LongPolling {
            let deadline = Instant::now() + Duration::from_secs(body.max_wait_secs);
            while state.queue.is_empty() && Instant::now() < deadline {
                let _ = entry.cond.wait_until(&mut state, deadline);
            }
        }

        state.last_seen = Instant::now();
        let drained = std::mem::take(&mut state.queue);
        trace!(
            client = %message.client_node_id,
            count = drained.len(),
            "Poll drained events"
        );
        drained
    }

    // Register or refresh the caller's sendbox entry and sweep the stale
    // ones while the map is already locked.
    fn touch(&self, client_node_id: &str) -> Arc<EventBox> {
        let mut sendbox = self.sendbox.lock();
        let now = Instant::now();

        sendbox.retain(|client, entry| {
            let stale = client != client_node_id
                && now.duration_since(entry.state.lock().last_seen) > self.config.sweep_age;
            if stale {
                debug!(client = %client, "Sweeping stale sendbox entry");
            }
            !stale
        });

        let entry = sendbox
            .entry(client_node_id.to_owned())
            .or_insert_with(|| {
                Arc::new(EventBox {
                    state: Mutex::new(BoxState {
                        queue: Vec::new(),
                        last_seen: now,
                    }),
                    cond: Condvar::new(),
                })
            });
        entry.state.lock().last_seen = now;
        Arc::clone(entry)
    }
}

impl<H: MessageHandler> std::fmt::Debug for SyncServerNode<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServerNode")
            .field("node_id", &self.node_id)
            .field("clients", &self.sendbox.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::message::ErrorCode;

    fn echo(message: MessageDto) -> Result<Option<MessageDto>, NodeError> {
        Ok(Some(message.with_body(serde_json::json!({"echoed": true}))))
    }

    fn poll_message(client: &str, body: serde_json::Value) -> MessageDto {
        MessageDto::new(Action::CheckReaderEvent, "poll-session", client).with_body(body)
    }

    #[test]
    fn test_regular_request_is_dispatched() {
        let node = SyncServerNode::new(echo, NodeConfig::default());
        let replies = node
            .on_request(MessageDto::new(
                Action::ReaderTransmit,
                "session-1",
                "client-1",
            ))
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].server_node_id.as_deref(), Some(node.node_id()));
    }

    #[test]
    fn test_handler_error_is_reported_in_band() {
        let failing = |_m: MessageDto| -> Result<Option<MessageDto>, NodeError> {
            Err(NodeError::Transport("dead reader".into()))
        };
        let node = SyncServerNode::new(failing, NodeConfig::default());
        let replies = node
            .on_request(MessageDto::new(
                Action::ReaderTransmit,
                "session-1",
                "client-1",
            ))
            .unwrap();
        assert_eq!(replies[0].action, Action::Error);
        assert_eq!(replies[0].error_body().unwrap().code, ErrorCode::Unknown);
    }

    #[test]
    fn test_short_poll_drains_queued_events() {
        let node = SyncServerNode::new(echo, NodeConfig::default());

        // First poll registers the client
        let drained = node
            .on_request(poll_message(
                "client-1",
                serde_json::json!({"strategy": "POLLING"}),
            ))
            .unwrap();
        assert!(drained.is_empty());

        node.push_event(
            "client-1",
            MessageDto::new(Action::ReaderEvent, "event-session", "client-1"),
        )
        .unwrap();
        node.push_event(
            "client-1",
            MessageDto::new(Action::PluginEvent, "event-session", "client-1"),
        )
        .unwrap();

        let drained = node
            .on_request(poll_message(
                "client-1",
                serde_json::json!({"strategy": "POLLING"}),
            ))
            .unwrap();
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn test_long_poll_wakes_on_event_arrival() {
        let node = Arc::new(SyncServerNode::new(echo, NodeConfig::default()));
        // Register the client first
        node.on_request(poll_message(
            "client-1",
            serde_json::json!({"strategy": "POLLING"}),
        ))
        .unwrap();

        let pusher = {
            let node = Arc::clone(&node);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                node.push_event(
                    "client-1",
                    MessageDto::new(Action::ReaderEvent, "event-session", "client-1"),
                )
                .unwrap();
            })
        };

        let started = Instant::now();
        let drained = node
            .on_request(poll_message(
                "client-1",
                serde_json::json!({"strategy": "LONG_POLLING", "max_wait_secs": 5}),
            ))
            .unwrap();
        pusher.join().unwrap();

        assert_eq!(drained.len(), 1);
        // Woken by the push, not by the 5 s bound
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_push_to_unknown_client_is_server_timeout() {
        let node = SyncServerNode::new(echo, NodeConfig::default());
        let err = node
            .push_event(
                "never-polled",
                MessageDto::new(Action::ReaderEvent, "event-session", "never-polled"),
            )
            .unwrap_err();
        assert_eq!(
            err,
            NodeError::ServerTimeout {
                client_node_id: "never-polled".into()
            }
        );
    }

    #[test]
    fn test_stale_entries_swept_on_insert() {
        let config = NodeConfig::new().with_sweep_age(Duration::from_millis(20));
        let node = SyncServerNode::new(echo, config);

        node.on_request(poll_message(
            "client-old",
            serde_json::json!({"strategy": "POLLING"}),
        ))
        .unwrap();
        thread::sleep(Duration::from_millis(50));

        // A different client's poll sweeps the idle entry
        node.on_request(poll_message(
            "client-new",
            serde_json::json!({"strategy": "POLLING"}),
        ))
        .unwrap();

        assert!(matches!(
            node.push_event(
                "client-old",
                MessageDto::new(Action::ReaderEvent, "event-session", "client-old"),
            ),
            Err(NodeError::ServerTimeout { .. })
        ));
        // The fresh client is still reachable
        assert!(node
            .push_event(
                "client-new",
                MessageDto::new(Action::ReaderEvent, "event-session", "client-new"),
            )
            .is_ok());
    }
}
