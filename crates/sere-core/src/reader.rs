//! Reader entity combining transport, channel engine and monitoring
//!
//! [`SeReader`] is the application-facing handle for one physical reader
//! slot. Direct transmission and monitored detection share the same
//! channel engine behind a mutex, so a transmission can never interleave
//! with the monitoring job's own channel use.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::batch::{ProcessingMode, SeRequest, SeResponse};
use crate::channel::ChannelEngine;
use crate::error::Error;
use crate::event::{EventBus, EventHandler, ReaderEvent, SubscriptionId};
use crate::monitor::{
    DefaultSelection, InternalEvent, MonitoringConfig, MonitoringState, PollingMode,
    ReaderMonitor,
};
use crate::transport::SeTransport;

/// One secure element reader
///
/// Observation is supervised: removing the last observer stops detection,
/// and dropping the reader shuts the monitoring machinery down
/// deterministically. Cleanup never relies on garbage collection of
/// background threads.
pub struct SeReader<T: SeTransport + 'static> {
    name: String,
    engine: Arc<Mutex<ChannelEngine<T>>>,
    events: Arc<EventBus<ReaderEvent>>,
    monitor: ReaderMonitor<T>,
}

impl<T: SeTransport + 'static> SeReader<T> {
    /// Create a reader with default monitoring configuration
    pub fn new(name: impl Into<String>, transport: T) -> Self {
        Self::with_config(name, transport, MonitoringConfig::default())
    }

    /// Create a reader with an explicit monitoring configuration
    pub fn with_config(
        name: impl Into<String>,
        transport: T,
        config: MonitoringConfig,
    ) -> Self {
        let name = name.into();
        let engine = Arc::new(Mutex::new(ChannelEngine::new(transport)));
        let events = Arc::new(EventBus::new());
        let monitor = ReaderMonitor::new(
            name.clone(),
            config,
            Arc::clone(&engine),
            Arc::clone(&events),
        );
        Self {
            name,
            engine,
            events,
            monitor,
        }
    }

    /// Name of this reader
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether an SE is currently present
    pub fn is_se_present(&self) -> Result<bool, Error> {
        self.engine.lock().is_se_present()
    }

    /// Execute a single request against the inserted SE
    ///
    /// `None` means the request's protocol filter did not match. Partial
    /// results of a failed request travel in the error, see
    /// [`BatchError`](crate::error::BatchError).
    pub fn transmit(&self, request: &SeRequest) -> Result<Option<SeResponse>, Error> {
        self.engine.lock().transmit(request)
    }

    /// Execute an ordered batch of requests
    pub fn transmit_set(
        &self,
        requests: &[SeRequest],
        mode: ProcessingMode,
    ) -> Result<Vec<Option<SeResponse>>, Error> {
        self.engine.lock().transmit_set(requests, mode)
    }

    /// Register (or clear) the selection run automatically on insertion
    pub fn set_default_selection(&self, selection: Option<DefaultSelection>) {
        self.monitor.set_default_selection(selection);
    }

    /// Start SE detection with the given polling mode
    pub fn start_se_detection(&self, polling_mode: PollingMode) -> Result<(), Error> {
        debug!(reader = %self.name, ?polling_mode, "Starting SE detection");
        Ok(self.monitor.start_detection(polling_mode)?)
    }

    /// Stop SE detection
    ///
    /// Interrupts any blocked monitoring job and returns once the reader
    /// is back in [`MonitoringState::WaitForStartDetection`].
    pub fn stop_se_detection(&self) {
        debug!(reader = %self.name, "Stopping SE detection");
        self.monitor.stop_detection();
    }

    /// Signal that the application finished processing the inserted SE
    ///
    /// Moves the state machine from processing to removal detection;
    /// ignored in any other state.
    pub fn notify_se_processed(&self) {
        self.monitor.notify_processed();
    }

    /// Inject a removal observation from outside the monitoring jobs
    ///
    /// Intended for plugin bindings that learn about removal through their
    /// own event source.
    pub fn notify_se_removed(&self) {
        self.monitor.post(InternalEvent::SeRemoved);
    }

    /// Current state of the monitoring state machine
    pub fn monitoring_state(&self) -> MonitoringState {
        self.monitor.current_state()
    }

    /// Subscribe an observer to this reader's events
    pub fn add_observer<H>(&self, handler: H) -> SubscriptionId
    where
        H: EventHandler<ReaderEvent> + 'static,
    {
        self.events.subscribe(handler)
    }

    /// Subscribe through a channel
    pub fn observe(&self) -> (SubscriptionId, crossbeam_channel::Receiver<ReaderEvent>) {
        self.events.subscribe_channel()
    }

    /// Remove an observer; detection stops when the last one is gone
    pub fn remove_observer(&self, id: SubscriptionId) -> bool {
        let removed = self.events.unsubscribe(id);
        if removed && self.events.observer_count() == 0 {
            debug!(reader = %self.name, "Last observer removed, stopping detection");
            self.stop_se_detection();
        }
        removed
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.events.observer_count()
    }
}

impl<T: SeTransport + 'static> Drop for SeReader<T> {
    fn drop(&mut self) {
        self.monitor.shutdown();
    }
}

impl<T: SeTransport + 'static> fmt::Debug for SeReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeReader")
            .field("name", &self.name)
            .field("state", &self.monitor.current_state())
            .field("observers", &self.events.observer_count())
            .finish()
    }
}
