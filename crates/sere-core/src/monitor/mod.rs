//! Monitoring state machine for observable readers
//!
//! Each reader owns one state machine driving SE insertion detection,
//! processing and removal detection:
//!
//! ```text
//! WaitForStartDetection --start_detection--> WaitForSeInsertion
//! WaitForSeInsertion --SeInserted(notified)--> WaitForSeProcessing
//! WaitForSeInsertion --SeInserted(silent)----> WaitForSeRemoval
//! WaitForSeInsertion --TimeOut--> WaitForSeInsertion (re-arm)
//! WaitForSeProcessing --SeProcessed--> WaitForSeRemoval
//! WaitForSeRemoval --SeRemoved, Repeating--> WaitForSeInsertion
//! WaitForSeRemoval --SeRemoved, SingleShot/Stop--> WaitForStartDetection
//! any --StopDetect--> WaitForStartDetection
//! ```
//!
//! Every state except `WaitForStartDetection` runs a monitoring job on a
//! background thread (see [`job`]). State switches serialize through a
//! mutex/condvar pair: an in-flight switch completes before the next one is
//! accepted, so the reader never runs two jobs at once. Jobs post their
//! detection results to a mailbox drained by a dedicated dispatcher thread
//! and never enter the switch lock themselves, which keeps job cancellation
//! (flag, wakeup, join) free of lock-ordering hazards. Observer
//! notification is deferred until after a switch commits, so an observer
//! callback may call back into the reader API.

pub(crate) mod job;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::batch::{ProcessingMode, SeRequest};
use crate::channel::ChannelEngine;
use crate::error::MonitorError;
use crate::event::{EventBus, ReaderEvent, ReaderEventKind};
use crate::selection::SelectionStatus;
use crate::transport::SeTransport;
use self::job::JobHandle;

/// States of the reader monitoring state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringState {
    /// Detection has not been started
    WaitForStartDetection,
    /// Waiting for an SE to be inserted
    WaitForSeInsertion,
    /// An SE was inserted and notified; waiting for the application to
    /// finish processing it
    WaitForSeProcessing,
    /// Waiting for the SE to be removed
    WaitForSeRemoval,
}

/// Policy applied after a removal event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingMode {
    /// Go back to insertion detection
    Repeating,
    /// Detect one insertion/removal cycle, then stop
    SingleShot,
    /// Halt detection
    Stop,
}

/// When insertion events are delivered to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    /// Notify every insertion, matched or not
    Always,
    /// Notify only insertions whose default selection matched; others are
    /// closed silently
    MatchedOnly,
}

/// Default selection executed automatically on SE insertion
#[derive(Debug, Clone)]
pub struct DefaultSelection {
    /// Selection requests run through the batch engine
    pub requests: Vec<SeRequest>,
    /// Batch processing mode
    pub mode: ProcessingMode,
    /// Event delivery policy
    pub notification: NotificationMode,
}

/// Timing configuration of the monitoring jobs
#[derive(Debug, Clone, Copy)]
pub struct MonitoringConfig {
    /// Interval between presence polls
    pub poll_interval: Duration,
    /// Bound on one insertion wait; elapsing re-arms detection and raises a
    /// timeout event
    pub insertion_timeout: Option<Duration>,
    /// Bound on one removal wait; elapsing re-arms detection and raises a
    /// timeout event
    pub removal_timeout: Option<Duration>,
    /// Bound on application processing; elapsing moves to removal
    /// detection and raises a timeout event
    pub processing_timeout: Option<Duration>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            insertion_timeout: None,
            removal_timeout: None,
            processing_timeout: None,
        }
    }
}

impl MonitoringConfig {
    /// Create a default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the presence poll interval
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound insertion detection
    pub const fn with_insertion_timeout(mut self, timeout: Duration) -> Self {
        self.insertion_timeout = Some(timeout);
        self
    }

    /// Bound removal detection
    pub const fn with_removal_timeout(mut self, timeout: Duration) -> Self {
        self.removal_timeout = Some(timeout);
        self
    }

    /// Bound application processing
    pub const fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = Some(timeout);
        self
    }
}

/// Internal events driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalEvent {
    /// A monitoring job detected an insertion
    SeInserted,
    /// The application finished processing the SE
    SeProcessed,
    /// A monitoring job detected the removal
    SeRemoved,
    /// Detection is being stopped
    StopDetect,
    /// A monitoring job or watchdog hit its bound
    TimeOut,
}

// Event with the insertion outcome resolved, fed to the pure transition
// function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvedEvent {
    Inserted { notified: bool },
    Processed,
    Removed,
    Stop,
    TimeOut,
}

const fn transition(
    current: MonitoringState,
    event: ResolvedEvent,
    polling_mode: PollingMode,
) -> Option<MonitoringState> {
    use MonitoringState::*;
    use ResolvedEvent::*;

    match (current, event) {
        (WaitForSeInsertion, Inserted { notified: true }) => Some(WaitForSeProcessing),
        (WaitForSeInsertion, Inserted { notified: false }) => Some(WaitForSeRemoval),
        (WaitForSeInsertion, TimeOut) => Some(WaitForSeInsertion),
        (WaitForSeProcessing, Processed) => Some(WaitForSeRemoval),
        (WaitForSeProcessing, TimeOut) => Some(WaitForSeRemoval),
        (WaitForSeRemoval, Removed) => Some(match polling_mode {
            PollingMode::Repeating => WaitForSeInsertion,
            PollingMode::SingleShot | PollingMode::Stop => WaitForStartDetection,
        }),
        (WaitForSeRemoval, TimeOut) => Some(WaitForSeRemoval),
        (WaitForStartDetection, Stop) => None,
        (_, Stop) => Some(WaitForStartDetection),
        _ => None,
    }
}

// Mailbox messages of the dispatcher thread.
enum Dispatch {
    Event(InternalEvent),
    Shutdown,
}

struct SwitchState {
    current: MonitoringState,
    polling_mode: PollingMode,
    job: Option<JobHandle>,
    switching: bool,
}

struct MonitorInner<T: SeTransport> {
    reader_name: String,
    config: MonitoringConfig,
    engine: Arc<Mutex<ChannelEngine<T>>>,
    events: Arc<EventBus<ReaderEvent>>,
    default_selection: Mutex<Option<DefaultSelection>>,
    sm: Mutex<SwitchState>,
    cond: Condvar,
    mailbox: Sender<Dispatch>,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Monitoring state machine of one reader
pub(crate) struct ReaderMonitor<T: SeTransport + 'static> {
    inner: Arc<MonitorInner<T>>,
}

impl<T: SeTransport + 'static> Clone for ReaderMonitor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SeTransport + 'static> ReaderMonitor<T> {
    pub(crate) fn new(
        reader_name: String,
        config: MonitoringConfig,
        engine: Arc<Mutex<ChannelEngine<T>>>,
        events: Arc<EventBus<ReaderEvent>>,
    ) -> Self {
        let (mailbox, inbox) = unbounded();
        let monitor = Self {
            inner: Arc::new(MonitorInner {
                reader_name,
                config,
                engine,
                events,
                default_selection: Mutex::new(None),
                sm: Mutex::new(SwitchState {
                    current: MonitoringState::WaitForStartDetection,
                    polling_mode: PollingMode::SingleShot,
                    job: None,
                    switching: false,
                }),
                cond: Condvar::new(),
                mailbox,
                dispatcher: Mutex::new(None),
            }),
        };

        let dispatcher = {
            let monitor = monitor.clone();
            thread::spawn(move || {
                while let Ok(message) = inbox.recv() {
                    match message {
                        Dispatch::Event(event) => monitor.process_event(event),
                        Dispatch::Shutdown => break,
                    }
                }
            })
        };
        *monitor.inner.dispatcher.lock() = Some(dispatcher);

        monitor
    }

    pub(crate) fn current_state(&self) -> MonitoringState {
        self.inner.sm.lock().current
    }

    pub(crate) fn set_default_selection(&self, selection: Option<DefaultSelection>) {
        *self.inner.default_selection.lock() = selection;
    }

    /// Start detection; fails when detection is already running
    pub(crate) fn start_detection(&self, polling_mode: PollingMode) -> Result<(), MonitorError> {
        let inner = &self.inner;
        let mut guard = inner.sm.lock();
        while guard.switching {
            inner.cond.wait(&mut guard);
        }
        if guard.current != MonitoringState::WaitForStartDetection {
            return Err(MonitorError::AlreadyStarted);
        }
        guard.polling_mode = polling_mode;
        guard.switching = true;
        drop(guard);

        self.commit(MonitoringState::WaitForSeInsertion, None);
        Ok(())
    }

    /// Stop detection and return once the machine is idle
    pub(crate) fn stop_detection(&self) {
        self.process_event(InternalEvent::StopDetect);
    }

    /// Signal that the application finished processing the inserted SE
    pub(crate) fn notify_processed(&self) {
        self.process_event(InternalEvent::SeProcessed);
    }

    // Entry point used by jobs; never blocks on the switch lock.
    pub(crate) fn post(&self, event: InternalEvent) {
        if self.inner.mailbox.send(Dispatch::Event(event)).is_err() {
            warn!(
                reader = %self.inner.reader_name,
                "Monitor mailbox closed, dropping event"
            );
        }
    }

    /// Stop detection and terminate the dispatcher thread
    pub(crate) fn shutdown(&self) {
        self.stop_detection();
        let _ = self.inner.mailbox.send(Dispatch::Shutdown);
        let handle = self.inner.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    // Apply one internal event under the switch discipline: wait for any
    // in-flight switch, cancel the active job, run side effects, commit the
    // new state and only then notify observers.
    fn process_event(&self, event: InternalEvent) {
        let inner = &self.inner;
        let mut guard = inner.sm.lock();
        while guard.switching {
            inner.cond.wait(&mut guard);
        }
        let current = guard.current;
        let polling_mode = guard.polling_mode;

        if !event_applies(current, event) {
            trace!(reader = %inner.reader_name, ?current, ?event, "Ignoring event");
            return;
        }

        guard.switching = true;
        let old_job = guard.job.take();
        drop(guard);

        if let Some(job) = old_job {
            job.cancel_and_join();
        }

        // Side effects run outside the lock; only this thread may switch.
        let (resolved, notification) = self.resolve(event);

        match transition(current, resolved, polling_mode) {
            Some(target) => {
                debug!(
                    reader = %inner.reader_name,
                    from = ?current,
                    to = ?target,
                    ?event,
                    "Monitoring state transition"
                );
                self.commit(target, notification);
            }
            None => self.commit(current, notification),
        }
    }

    // Commit the state, start its job, release the switch and deliver any
    // pending observer notification.
    fn commit(&self, target: MonitoringState, notification: Option<ReaderEvent>) {
        let inner = &self.inner;
        let job = self.spawn_job_for(target);
        let mut guard = inner.sm.lock();
        guard.current = target;
        guard.job = job;
        guard.switching = false;
        inner.cond.notify_all();
        drop(guard);

        if let Some(event) = notification {
            inner.events.publish(event);
        }
    }

    fn spawn_job_for(&self, state: MonitoringState) -> Option<JobHandle> {
        match state {
            MonitoringState::WaitForStartDetection => None,
            MonitoringState::WaitForSeInsertion => Some(job::spawn_insertion(self.clone())),
            MonitoringState::WaitForSeProcessing => job::spawn_processing_watchdog(self.clone()),
            MonitoringState::WaitForSeRemoval => Some(job::spawn_removal(self.clone())),
        }
    }

    // Map an internal event to its resolved form, running the insertion
    // classification and removal cleanup side effects.
    fn resolve(&self, event: InternalEvent) -> (ResolvedEvent, Option<ReaderEvent>) {
        match event {
            InternalEvent::SeInserted => match self.process_inserted() {
                Some(reader_event) => (ResolvedEvent::Inserted { notified: true }, Some(reader_event)),
                None => (ResolvedEvent::Inserted { notified: false }, None),
            },
            InternalEvent::SeProcessed => (ResolvedEvent::Processed, None),
            InternalEvent::SeRemoved => {
                self.inner.engine.lock().reset_on_removal();
                let event =
                    ReaderEvent::new(self.inner.reader_name.clone(), ReaderEventKind::SeRemoved);
                (ResolvedEvent::Removed, Some(event))
            }
            InternalEvent::StopDetect => (ResolvedEvent::Stop, None),
            InternalEvent::TimeOut => {
                let event = ReaderEvent::new(
                    self.inner.reader_name.clone(),
                    ReaderEventKind::TimeoutError,
                );
                (ResolvedEvent::TimeOut, Some(event))
            }
        }
    }

    // Classify an insertion: run the default selection if one is
    // registered and decide which event, if any, observers receive.
    // Exactly one qualifying event is produced per insertion.
    fn process_inserted(&self) -> Option<ReaderEvent> {
        let inner = &self.inner;
        let selection = inner.default_selection.lock().clone();

        let Some(selection) = selection else {
            return Some(ReaderEvent::new(
                inner.reader_name.clone(),
                ReaderEventKind::SeInserted,
            ));
        };

        let result = inner
            .engine
            .lock()
            .transmit_set(&selection.requests, selection.mode);
        let responses = match result {
            Ok(responses) => responses,
            Err(e) => {
                warn!(
                    reader = %inner.reader_name,
                    error = %e,
                    "Default selection failed, waiting for removal"
                );
                return None;
            }
        };

        let matched = responses
            .iter()
            .flatten()
            .any(|r| r.selection_status().is_some_and(SelectionStatus::has_matched));

        let kind = match (matched, selection.notification) {
            (true, _) => ReaderEventKind::SeMatched,
            (false, NotificationMode::Always) => ReaderEventKind::SeInserted,
            (false, NotificationMode::MatchedOnly) => {
                // Silent: the batch engine already closed the channel
                debug!(reader = %inner.reader_name, "Default selection did not match");
                return None;
            }
        };

        Some(
            ReaderEvent::new(inner.reader_name.clone(), kind)
                .with_default_response(responses),
        )
    }

    pub(crate) fn engine(&self) -> &Arc<Mutex<ChannelEngine<T>>> {
        &self.inner.engine
    }

    pub(crate) fn config(&self) -> &MonitoringConfig {
        &self.inner.config
    }

    pub(crate) fn reader_name(&self) -> &str {
        &self.inner.reader_name
    }
}

// Cheap pre-check so ignored events leave the active job untouched.
const fn event_applies(current: MonitoringState, event: InternalEvent) -> bool {
    use MonitoringState::*;

    match event {
        InternalEvent::SeInserted => matches!(current, WaitForSeInsertion),
        InternalEvent::SeProcessed => matches!(current, WaitForSeProcessing),
        InternalEvent::SeRemoved => matches!(current, WaitForSeRemoval),
        InternalEvent::StopDetect => !matches!(current, WaitForStartDetection),
        InternalEvent::TimeOut => !matches!(current, WaitForStartDetection),
    }
}
