//! Typed event bus for reader and plugin events
//!
//! Observers subscribe to one event variant with a closure, a handler
//! implementation or a crossbeam channel; there is no runtime type
//! inspection and no shared observer list across variants. Publishing
//! clones the event per observer.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::RwLock;
use tracing::warn;

use crate::batch::SeResponse;

/// Events published by an observed reader
#[derive(Debug, Clone)]
pub struct ReaderEvent {
    /// Name of the reader that raised the event
    pub reader_name: String,
    /// What happened
    pub kind: ReaderEventKind,
    /// Responses of the default selection run on insertion, when one was
    /// configured
    pub default_response: Option<Vec<Option<SeResponse>>>,
}

impl ReaderEvent {
    /// Create an event without default selection responses
    pub fn new(reader_name: impl Into<String>, kind: ReaderEventKind) -> Self {
        Self {
            reader_name: reader_name.into(),
            kind,
            default_response: None,
        }
    }

    /// Attach the default selection responses
    pub fn with_default_response(mut self, responses: Vec<Option<SeResponse>>) -> Self {
        self.default_response = Some(responses);
        self
    }
}

/// Kind of reader event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderEventKind {
    /// An SE was inserted (no default selection, or one that is notified
    /// unconditionally)
    SeInserted,
    /// An SE was inserted and the default selection matched
    SeMatched,
    /// The SE was removed
    SeRemoved,
    /// Insertion or removal detection timed out
    TimeoutError,
}

/// Events published by a reader registry
#[derive(Debug, Clone)]
pub struct PluginEvent {
    /// Names of the readers concerned
    pub reader_names: Vec<String>,
    /// What happened
    pub kind: PluginEventKind,
}

/// Kind of plugin event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginEventKind {
    /// Readers appeared
    ReaderConnected,
    /// Readers disappeared
    ReaderDisconnected,
}

/// Handle identifying one subscription on a bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Trait for types observing events of one variant
pub trait EventHandler<E>: Send + Sync {
    /// Handle an event
    fn handle(&self, event: E);
}

impl<E, F> EventHandler<E> for F
where
    F: Fn(E) + Send + Sync,
{
    fn handle(&self, event: E) {
        self(event)
    }
}

/// Event bus parameterized by the event variant it carries
pub struct EventBus<E> {
    observers: RwLock<Vec<(SubscriptionId, Arc<dyn EventHandler<E>>)>>,
    next_id: AtomicU64,
}

impl<E: Clone> EventBus<E> {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribe a handler; the returned id unsubscribes it later
    pub fn subscribe<H>(&self, handler: H) -> SubscriptionId
    where
        H: EventHandler<E> + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, Arc::new(handler)));
        id
    }

    /// Subscribe a channel; events are dropped once the receiver is gone
    pub fn subscribe_channel(&self) -> (SubscriptionId, Receiver<E>)
    where
        E: Send + Sync + 'static,
    {
        let (sender, receiver): (Sender<E>, Receiver<E>) = unbounded();
        let id = self.subscribe(move |event: E| {
            if sender.send(event).is_err() {
                warn!("Event receiver dropped, discarding event");
            }
        });
        (id, receiver)
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    /// Number of active subscriptions
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Deliver an event to every observer
    ///
    /// Observers registered while a publish is in flight receive the next
    /// event; the list is snapshotted so handlers may subscribe or
    /// unsubscribe from within their callback.
    pub fn publish(&self, event: E) {
        let snapshot: Vec<Arc<dyn EventHandler<E>>> = self
            .observers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in snapshot {
            handler.handle(event.clone());
        }
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observers.read().len())
            .finish()
    }
}
