//! Drives a reader over a simulated transport: starts detection, watches
//! the insertion/removal cycle and prints the events.
//!
//! Run with `cargo run --example observe`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sere_core::prelude::*;
use sere_core::{MonitoringState, SeProtocol};

/// In-memory card slot standing in for reader hardware
#[derive(Debug, Clone)]
struct SimulatedSlot {
    state: Arc<Mutex<SlotState>>,
}

#[derive(Debug)]
struct SlotState {
    present: bool,
    physical_open: bool,
    responses: VecDeque<Bytes>,
}

impl SimulatedSlot {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SlotState {
                present: false,
                physical_open: false,
                responses: VecDeque::new(),
            })),
        }
    }
}

impl SeTransport for SimulatedSlot {
    fn check_presence(&mut self) -> Result<bool, TransportError> {
        Ok(self.state.lock().unwrap().present)
    }

    fn atr(&mut self) -> Option<Bytes> {
        Some(Bytes::from_static(&[0x3B, 0x8F, 0x80, 0x01]))
    }

    fn open_physical_channel(&mut self) -> Result<(), TransportError> {
        self.state.lock().unwrap().physical_open = true;
        Ok(())
    }

    fn close_physical_channel(&mut self) -> Result<(), TransportError> {
        self.state.lock().unwrap().physical_open = false;
        Ok(())
    }

    fn is_physical_channel_open(&self) -> bool {
        self.state.lock().unwrap().physical_open
    }

    fn do_transmit_apdu(&mut self, _command: &[u8]) -> Result<Bytes, TransportError> {
        self.state
            .lock()
            .unwrap()
            .responses
            .pop_front()
            .ok_or(TransportError::Transmission)
    }

    fn protocol_matches(&self, _protocol: &SeProtocol) -> Result<bool, TransportError> {
        Ok(true)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sere_core=debug".into()),
        )
        .init();

    let slot = SimulatedSlot::new();
    // Scripted card: FCI for the default selection, then one read record
    slot.state.lock().unwrap().responses.extend([
        Bytes::from_static(&[0x6F, 0x05, 0x84, 0x03, 0xA0, 0x00, 0x00, 0x90, 0x00]),
        Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF, 0x90, 0x00]),
    ]);

    let reader = SeReader::with_config(
        "simulated-reader",
        slot.clone(),
        MonitoringConfig::new().with_poll_interval(Duration::from_millis(50)),
    );

    let aid = AidSelector::new(Bytes::from_static(&[0xA0, 0x00, 0x00, 0x01, 0x51]))
        .expect("valid AID");
    reader.set_default_selection(Some(DefaultSelection {
        requests: vec![
            SeRequest::new(vec![ApduRequest::new(Bytes::from_static(&[
                0x00, 0xB2, 0x01, 0x0C,
            ]))])
            .with_selector(SeSelector::new().with_aid_selector(aid)),
        ],
        mode: ProcessingMode::FirstMatch,
        notification: NotificationMode::MatchedOnly,
    }));

    let (_subscription, events) = reader.observe();
    reader
        .start_se_detection(PollingMode::SingleShot)
        .expect("detection starts");

    println!("waiting for card insertion...");
    slot.state.lock().unwrap().present = true;

    let event = events
        .recv_timeout(Duration::from_secs(5))
        .expect("insertion event");
    println!("event: {:?} on {}", event.kind, event.reader_name);
    if let Some(responses) = &event.default_response {
        for response in responses.iter().flatten() {
            for apdu in response.apdu_responses() {
                println!("  apdu response: {apdu:?}");
            }
        }
    }

    reader.notify_se_processed();
    slot.state.lock().unwrap().present = false;

    let event = events
        .recv_timeout(Duration::from_secs(5))
        .expect("removal event");
    println!("event: {:?} on {}", event.kind, event.reader_name);

    assert_eq!(
        reader.monitoring_state(),
        MonitoringState::WaitForStartDetection
    );
    println!("detection cycle complete");
}
