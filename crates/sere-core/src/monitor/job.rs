//! Monitoring jobs run by the state machine
//!
//! A job is a background thread owned by exactly one monitoring state. It
//! either polls the transport's presence capability at the configured
//! interval or blocks on the transport's native wait calls in bounded
//! slices, so that cancellation (flag set plus condvar wakeup) interrupts
//! it promptly. Jobs report through the monitor mailbox and never touch the
//! switch lock; a transport failure inside a job is logged and mapped to a
//! stop or removal event instead of crashing the thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use super::{InternalEvent, ReaderMonitor};
use crate::transport::{SeTransport, TransportError};

// Upper bound on one native blocking wait, keeping cancellation latency low.
const NATIVE_WAIT_SLICE: Duration = Duration::from_millis(200);

/// Cancellation token shared between a job thread and its owner
#[derive(Debug, Default)]
pub(crate) struct CancelToken {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl CancelToken {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Interruptible sleep; returns false when cancelled
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let mut guard = self.lock.lock();
        if self.is_cancelled() {
            return false;
        }
        let _ = self.cond.wait_for(&mut guard, duration);
        !self.is_cancelled()
    }
}

/// Handle on a running monitoring job
#[derive(Debug)]
pub(crate) struct JobHandle {
    token: Arc<CancelToken>,
    thread: thread::JoinHandle<()>,
}

impl JobHandle {
    /// Cancel the job and wait for its thread to exit
    pub(crate) fn cancel_and_join(self) {
        self.token.cancel();
        if let Err(e) = self.thread.join() {
            warn!(panic = ?e, "Monitoring job panicked");
        }
    }
}

fn spawn(name: &str, body: impl FnOnce(Arc<CancelToken>) + Send + 'static) -> JobHandle {
    let token = Arc::new(CancelToken::default());
    let thread_token = Arc::clone(&token);
    let thread = thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || body(thread_token))
        .expect("failed to spawn monitoring job thread");
    JobHandle { token, thread }
}

/// Start the insertion detection job appropriate for the transport
pub(crate) fn spawn_insertion<T: SeTransport + 'static>(monitor: ReaderMonitor<T>) -> JobHandle {
    let native = monitor.engine().lock().transport().capabilities().smart_insertion;
    let name = format!("sere-insertion-{}", monitor.reader_name());
    spawn(&name, move |token| {
        if native {
            wait_native(
                &monitor,
                &token,
                monitor.config().insertion_timeout,
                true,
                |t, slice| t.wait_for_se_present(slice),
            );
        } else {
            poll_presence(&monitor, &token, monitor.config().insertion_timeout, true);
        }
    })
}

/// Start the removal detection job appropriate for the transport
pub(crate) fn spawn_removal<T: SeTransport + 'static>(monitor: ReaderMonitor<T>) -> JobHandle {
    let native = monitor.engine().lock().transport().capabilities().smart_presence;
    let name = format!("sere-removal-{}", monitor.reader_name());
    spawn(&name, move |token| {
        if native {
            wait_native(
                &monitor,
                &token,
                monitor.config().removal_timeout,
                false,
                |t, slice| t.wait_for_se_absent(slice),
            );
        } else {
            poll_presence(&monitor, &token, monitor.config().removal_timeout, false);
        }
    })
}

/// Start the processing watchdog when a processing bound is configured
pub(crate) fn spawn_processing_watchdog<T: SeTransport + 'static>(
    monitor: ReaderMonitor<T>,
) -> Option<JobHandle> {
    let timeout = monitor.config().processing_timeout?;
    let name = format!("sere-processing-{}", monitor.reader_name());
    Some(spawn(&name, move |token| {
        if token.sleep(timeout) {
            trace!(reader = %monitor.reader_name(), "Processing timeout elapsed");
            monitor.post(InternalEvent::TimeOut);
        }
    }))
}

// Poll check_presence until it reports the awaited value. `awaiting`
// selects insertion (true) or removal (false) detection.
fn poll_presence<T: SeTransport + 'static>(
    monitor: &ReaderMonitor<T>,
    token: &CancelToken,
    timeout: Option<Duration>,
    awaiting: bool,
) {
    let started = Instant::now();
    loop {
        if token.is_cancelled() {
            return;
        }
        let presence = monitor.engine().lock().transport_mut().check_presence();
        match presence {
            Ok(present) if present == awaiting => {
                let event = if awaiting {
                    InternalEvent::SeInserted
                } else {
                    InternalEvent::SeRemoved
                };
                monitor.post(event);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    reader = %monitor.reader_name(),
                    error = %e,
                    "Presence check failed in monitoring job"
                );
                monitor.post(failure_event(awaiting));
                return;
            }
        }
        if elapsed_past(started, timeout) {
            monitor.post(InternalEvent::TimeOut);
            return;
        }
        if !token.sleep(monitor.config().poll_interval) {
            return;
        }
    }
}

// Drive a native blocking wait in bounded slices. The closure maps to
// wait_for_se_present or wait_for_se_absent; Ok(true) means detected.
fn wait_native<T, F>(
    monitor: &ReaderMonitor<T>,
    token: &CancelToken,
    timeout: Option<Duration>,
    awaiting_insertion: bool,
    mut wait: F,
) where
    T: SeTransport + 'static,
    F: FnMut(&mut T, Duration) -> Result<bool, TransportError>,
{
    let started = Instant::now();
    loop {
        if token.is_cancelled() {
            return;
        }
        let outcome = wait(monitor.engine().lock().transport_mut(), NATIVE_WAIT_SLICE);
        match outcome {
            Ok(true) => {
                let event = if awaiting_insertion {
                    InternalEvent::SeInserted
                } else {
                    InternalEvent::SeRemoved
                };
                monitor.post(event);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    reader = %monitor.reader_name(),
                    error = %e,
                    "Native wait failed in monitoring job"
                );
                monitor.post(failure_event(awaiting_insertion));
                return;
            }
        }
        if elapsed_past(started, timeout) {
            monitor.post(InternalEvent::TimeOut);
            return;
        }
    }
}

// A failing job is treated as a removal (when waiting for removal) or a
// detection stop (when waiting for insertion), never as a crash.
const fn failure_event(awaiting_insertion: bool) -> InternalEvent {
    if awaiting_insertion {
        InternalEvent::StopDetect
    } else {
        InternalEvent::SeRemoved
    }
}

fn elapsed_past(started: Instant, timeout: Option<Duration>) -> bool {
    timeout.is_some_and(|t| started.elapsed() >= t)
}
