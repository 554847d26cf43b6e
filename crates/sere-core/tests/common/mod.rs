//! Shared scriptable transport for integration tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sere_core::{Bytes, Capabilities, SeProtocol, SeTransport, TransportError};

#[derive(Debug, Default)]
pub struct CardSlot {
    pub present: bool,
    pub atr: Option<Bytes>,
    pub physical_open: bool,
    pub protocols: Vec<String>,
    pub responses: VecDeque<Result<Bytes, TransportError>>,
    pub commands: Vec<Bytes>,
    pub capabilities: Capabilities,
}

/// Transport around a shared scriptable card slot
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    pub slot: Arc<Mutex<CardSlot>>,
}

impl ScriptedTransport {
    pub fn new(atr: &'static [u8]) -> Self {
        Self {
            slot: Arc::new(Mutex::new(CardSlot {
                present: true,
                atr: Some(Bytes::from_static(atr)),
                protocols: vec!["ISO_14443_4".to_owned()],
                ..CardSlot::default()
            })),
        }
    }

    pub fn respond(&self, response: &'static [u8]) {
        self.slot
            .lock()
            .unwrap()
            .responses
            .push_back(Ok(Bytes::from_static(response)));
    }

    pub fn fail_next(&self) {
        self.slot
            .lock()
            .unwrap()
            .responses
            .push_back(Err(TransportError::Transmission));
    }

    pub fn insert_card(&self) {
        self.slot.lock().unwrap().present = true;
    }

    pub fn remove_card(&self) {
        self.slot.lock().unwrap().present = false;
    }

    pub fn command_count(&self) -> usize {
        self.slot.lock().unwrap().commands.len()
    }
}

impl SeTransport for ScriptedTransport {
    fn check_presence(&mut self) -> Result<bool, TransportError> {
        Ok(self.slot.lock().unwrap().present)
    }

    fn atr(&mut self) -> Option<Bytes> {
        self.slot.lock().unwrap().atr.clone()
    }

    fn open_physical_channel(&mut self) -> Result<(), TransportError> {
        self.slot.lock().unwrap().physical_open = true;
        Ok(())
    }

    fn close_physical_channel(&mut self) -> Result<(), TransportError> {
        self.slot.lock().unwrap().physical_open = false;
        Ok(())
    }

    fn is_physical_channel_open(&self) -> bool {
        self.slot.lock().unwrap().physical_open
    }

    fn do_transmit_apdu(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        let mut slot = self.slot.lock().unwrap();
        slot.commands.push(Bytes::copy_from_slice(command));
        slot.responses
            .pop_front()
            .unwrap_or(Err(TransportError::Transmission))
    }

    fn protocol_matches(&self, protocol: &SeProtocol) -> Result<bool, TransportError> {
        Ok(self
            .slot
            .lock()
            .unwrap()
            .protocols
            .iter()
            .any(|p| p.as_str() == protocol.as_str()))
    }

    fn capabilities(&self) -> Capabilities {
        self.slot.lock().unwrap().capabilities
    }

    fn wait_for_se_present(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.slot.lock().unwrap().present {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn wait_for_se_absent(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if !self.slot.lock().unwrap().present {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
