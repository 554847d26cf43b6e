//! Client node for request/response transports
//!
//! Requests map one-to-one onto transport round trips; the server returns
//! the paired response together with any messages it had queued. Because
//! the server cannot push, event observation runs as background loops, one
//! per event family, using either short-interval polling or long polling.
//! Each loop guards its body against failures and retries a broken
//! transport with Fibonacci backoff until connectivity returns or the loop
//! is stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::backoff::FibonacciBackoff;
use crate::endpoint::SyncClientEndpoint;
use crate::error::NodeError;
use crate::message::{Action, MessageDto};
use crate::node::{NodeConfig, generate_id};

/// Server-push emulation strategy of an event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStrategy {
    /// Poll at a fixed short interval
    Polling {
        /// Delay between polls
        interval: Duration,
    },
    /// Let the server hold each poll open until an event arrives
    LongPolling {
        /// Bound the server applies to one held poll
        timeout: Duration,
    },
}

impl EventStrategy {
    fn body(&self) -> serde_json::Value {
        match self {
            Self::Polling { .. } => serde_json::json!({ "strategy": "POLLING" }),
            Self::LongPolling { timeout } => serde_json::json!({
                "strategy": "LONG_POLLING",
                "max_wait_secs": timeout.as_secs(),
            }),
        }
    }
}

// Stop signal shared with the observation loops.
#[derive(Default)]
struct StopFlag {
    stopped: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl StopFlag {
    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    // Interruptible sleep; returns false once stopped.
    fn sleep(&self, duration: Duration) -> bool {
        let mut guard = self.lock.lock();
        if self.is_stopped() {
            return false;
        }
        let _ = self.cond.wait_for(&mut guard, duration);
        !self.is_stopped()
    }
}

struct ObservationLoop {
    flag: Arc<StopFlag>,
    thread: thread::JoinHandle<()>,
}

/// Client node over a [`SyncClientEndpoint`]
pub struct SyncClientNode<E: SyncClientEndpoint + 'static> {
    node_id: String,
    endpoint: Arc<E>,
    config: NodeConfig,
    event_tx: Sender<MessageDto>,
    event_rx: Receiver<MessageDto>,
    loops: Mutex<Vec<ObservationLoop>>,
}

impl<E: SyncClientEndpoint + 'static> SyncClientNode<E> {
    /// Create a node around an endpoint
    pub fn new(endpoint: E, config: NodeConfig) -> Self {
        let (event_tx, event_rx) = unbounded();
        Self {
            node_id: generate_id(),
            endpoint: Arc::new(endpoint),
            config,
            event_tx,
            event_rx,
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Id of this node
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Channel carrying the events gathered by the observation loops
    pub fn events(&self) -> Receiver<MessageDto> {
        self.event_rx.clone()
    }

    /// Send a request and return its paired response
    ///
    /// Events the server piggybacks on the transport response are routed
    /// to the event channel; a message tagged with a different session id
    /// is discarded, never delivered to this caller.
    pub fn send_request(&self, mut message: MessageDto) -> Result<MessageDto, NodeError> {
        if message.session_id.is_empty() {
            message.session_id = generate_id();
        }
        message.client_node_id = self.node_id.clone();
        let session_id = message.session_id.clone();

        let replies = self.endpoint.send_request(&message)?;

        let mut response = None;
        for reply in replies {
            match reply.action {
                Action::Error if reply.session_id == session_id => {
                    let error = reply
                        .error_body()
                        .map_or(NodeError::InvalidMessage("undecodable error body"), Into::into);
                    return Err(error);
                }
                Action::ReaderEvent | Action::PluginEvent => {
                    let _ = self.event_tx.send(reply);
                }
                _ if reply.session_id == session_id => response = Some(reply),
                _ => {
                    warn!(
                        session = %reply.session_id,
                        "Discarding reply for another session"
                    );
                }
            }
        }

        response.ok_or(NodeError::InvalidMessage("no response for session"))
    }

    /// Start a background loop observing one event family
    ///
    /// `action` must be [`Action::CheckReaderEvent`] or
    /// [`Action::CheckPluginEvent`]; gathered events land on
    /// [`events`](Self::events).
    pub fn start_observation(
        &self,
        action: Action,
        strategy: EventStrategy,
    ) -> Result<(), NodeError> {
        if !matches!(action, Action::CheckReaderEvent | Action::CheckPluginEvent) {
            return Err(NodeError::InvalidMessage("not an event-check action"));
        }

        let flag = Arc::new(StopFlag::default());
        let thread = {
            let flag = Arc::clone(&flag);
            let endpoint = Arc::clone(&self.endpoint);
            let event_tx = self.event_tx.clone();
            let node_id = self.node_id.clone();
            let config = self.config;
            thread::Builder::new()
                .name(format!("sere-observe-{action:?}"))
                .spawn(move || {
                    observation_loop(&flag, &*endpoint, &event_tx, &node_id, action, strategy, config);
                })
                .map_err(|e| NodeError::Transport(e.to_string()))?
        };

        self.loops.lock().push(ObservationLoop { flag, thread });
        Ok(())
    }

    /// Stop every observation loop and wait for their threads to exit
    pub fn stop_observation(&self) {
        let loops: Vec<ObservationLoop> = self.loops.lock().drain(..).collect();
        for entry in &loops {
            entry.flag.stop();
        }
        for entry in loops {
            if entry.thread.join().is_err() {
                warn!("Observation loop panicked");
            }
        }
    }
}

impl<E: SyncClientEndpoint + 'static> Drop for SyncClientNode<E> {
    fn drop(&mut self) {
        self.stop_observation();
    }
}

impl<E: SyncClientEndpoint + 'static> std::fmt::Debug for SyncClientNode<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClientNode")
            .field("node_id", &self.node_id)
            .field("loops", &self.loops.lock().len())
            .finish()
    }
}

// One observation loop: poll, forward, and back off through failures.
// Errors never escape the loop; only a stop request ends it.
fn observation_loop<E: SyncClientEndpoint>(
    flag: &StopFlag,
    endpoint: &E,
    event_tx: &Sender<MessageDto>,
    node_id: &str,
    action: Action,
    strategy: EventStrategy,
    config: NodeConfig,
) {
    let session_id = generate_id();
    let mut backoff = FibonacciBackoff::new(config.retry_base, config.retry_cap);

    while !flag.is_stopped() {
        let poll = MessageDto::new(action, session_id.clone(), node_id).with_body(strategy.body());

        match endpoint.send_request(&poll) {
            Ok(replies) => {
                backoff.reset();
                for reply in replies {
                    if event_tx.send(reply).is_err() {
                        debug!("Event receiver dropped, stopping observation loop");
                        return;
                    }
                }
                if let EventStrategy::Polling { interval } = strategy {
                    if !flag.sleep(interval) {
                        return;
                    }
                }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    error = %e,
                    retry_in = ?delay,
                    "Event poll failed, backing off"
                );
                if !flag.sleep(delay) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::message::ErrorCode;
    use crate::node::NodeConfig;
    use crate::server_sync::SyncServerNode;

    // Endpoint looping straight back into a sync server node.
    struct InProcessEndpoint {
        server: Arc<SyncServerNode<fn(MessageDto) -> Result<Option<MessageDto>, NodeError>>>,
        failures_left: AtomicUsize,
    }

    fn echo(message: MessageDto) -> Result<Option<MessageDto>, NodeError> {
        Ok(Some(message.with_body(serde_json::json!({"echoed": true}))))
    }

    impl InProcessEndpoint {
        fn new(server: Arc<SyncServerNode<fn(MessageDto) -> Result<Option<MessageDto>, NodeError>>>) -> Self {
            Self {
                server,
                failures_left: AtomicUsize::new(0),
            }
        }
    }

    impl SyncClientEndpoint for InProcessEndpoint {
        fn send_request(&self, message: &MessageDto) -> Result<Vec<MessageDto>, NodeError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(NodeError::Transport("link down".into()));
            }
            self.server.on_request(message.clone())
        }
    }

    // Pushing is only possible once the loop's first poll registered the
    // client; retry until the registration lands.
    fn push_event_eventually(
        server: &SyncServerNode<fn(MessageDto) -> Result<Option<MessageDto>, NodeError>>,
        client_node_id: &str,
        message: MessageDto,
    ) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            match server.push_event(client_node_id, message.clone()) {
                Ok(()) => return,
                Err(_) if std::time::Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("client never registered: {e}"),
            }
        }
    }

    fn wired() -> (
        Arc<SyncServerNode<fn(MessageDto) -> Result<Option<MessageDto>, NodeError>>>,
        SyncClientNode<InProcessEndpoint>,
    ) {
        let config = NodeConfig::new()
            .with_retry_backoff(Duration::from_millis(5), Duration::from_millis(50));
        let server = Arc::new(SyncServerNode::new(
            echo as fn(MessageDto) -> Result<Option<MessageDto>, NodeError>,
            config,
        ));
        let client = SyncClientNode::new(InProcessEndpoint::new(Arc::clone(&server)), config);
        (server, client)
    }

    #[test]
    fn test_request_response_roundtrip() {
        let (_server, client) = wired();
        let response = client
            .send_request(MessageDto::new(Action::ReaderTransmit, "", ""))
            .unwrap();
        assert_eq!(response.body, serde_json::json!({"echoed": true}));
    }

    #[test]
    fn test_error_reply_surfaces_as_remote_error() {
        let config = NodeConfig::default();
        let failing: fn(MessageDto) -> Result<Option<MessageDto>, NodeError> =
            |_m| Err(NodeError::Transport("dead reader".into()));
        let server = Arc::new(SyncServerNode::new(failing, config));
        let client = SyncClientNode::new(InProcessEndpoint::new(server), config);

        let err = client
            .send_request(MessageDto::new(Action::ReaderTransmit, "", ""))
            .unwrap_err();
        assert!(matches!(
            err,
            NodeError::Remote {
                code: ErrorCode::Unknown,
                ..
            }
        ));
    }

    #[test]
    fn test_polling_observation_gathers_pushed_events() {
        let (server, client) = wired();
        client
            .start_observation(
                Action::CheckReaderEvent,
                EventStrategy::Polling {
                    interval: Duration::from_millis(5),
                },
            )
            .unwrap();

        let events = client.events();
        push_event_eventually(
            &server,
            client.node_id(),
            MessageDto::new(Action::ReaderEvent, "event-session", client.node_id()),
        );

        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.action, Action::ReaderEvent);
        client.stop_observation();
    }

    #[test]
    fn test_long_polling_observation_delivers_immediately() {
        let (server, client) = wired();
        client
            .start_observation(
                Action::CheckReaderEvent,
                EventStrategy::LongPolling {
                    timeout: Duration::from_secs(1),
                },
            )
            .unwrap();

        let events = client.events();
        push_event_eventually(
            &server,
            client.node_id(),
            MessageDto::new(Action::ReaderEvent, "event-session", client.node_id()),
        );

        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.action, Action::ReaderEvent);
        client.stop_observation();
    }

    #[test]
    fn test_observation_survives_transport_failures() {
        let (server, client) = wired();
        // Three polls fail before the transport heals
        client.endpoint.failures_left.store(3, Ordering::SeqCst);

        client
            .start_observation(
                Action::CheckReaderEvent,
                EventStrategy::Polling {
                    interval: Duration::from_millis(5),
                },
            )
            .unwrap();

        let events = client.events();
        // The loop burns through the failures with backoff, then registers
        push_event_eventually(
            &server,
            client.node_id(),
            MessageDto::new(Action::ReaderEvent, "event-session", client.node_id()),
        );

        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.action, Action::ReaderEvent);
        client.stop_observation();
    }

    #[test]
    fn test_stop_observation_joins_loops() {
        let (_server, client) = wired();
        client
            .start_observation(
                Action::CheckReaderEvent,
                EventStrategy::Polling {
                    interval: Duration::from_millis(5),
                },
            )
            .unwrap();
        client
            .start_observation(
                Action::CheckPluginEvent,
                EventStrategy::Polling {
                    interval: Duration::from_millis(5),
                },
            )
            .unwrap();

        client.stop_observation();
        assert_eq!(client.loops.lock().len(), 0);
    }

    #[test]
    fn test_rejects_non_check_actions() {
        let (_server, client) = wired();
        assert!(client
            .start_observation(
                Action::ReaderTransmit,
                EventStrategy::Polling {
                    interval: Duration::from_millis(5),
                },
            )
            .is_err());
    }
}
