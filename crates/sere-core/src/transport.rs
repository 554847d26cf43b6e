//! Hardware capability interface implemented by reader bindings
//!
//! Concrete reader technologies (PC/SC, NFC, SE OS interfaces) implement
//! [`SeTransport`]. The trait covers the mandatory channel and transmission
//! primitives; optional hardware abilities are advertised through
//! [`Capabilities`] and the corresponding methods, which default to
//! [`TransportError::Unsupported`].

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::apdu::ApduResponse;
use crate::selection::{AidSelector, SeProtocol};

/// Transport error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Failed to connect to the device
    #[error("Failed to connect to device")]
    Connection,

    /// Failed to transmit data
    #[error("Failed to transmit data")]
    Transmission,

    /// Device error
    #[error("Device error")]
    Device,

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Capability not provided by this transport
    #[error("Unsupported capability: {0}")]
    Unsupported(&'static str),

    /// Other error with message
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Create a general other error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other(message.into())
    }
}

/// Optional hardware abilities advertised by a transport
///
/// Behavior is composed from these flags instead of reader subtypes: the
/// monitoring layer picks native blocking detection jobs when the matching
/// flag is set and falls back to polling otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Transport can block on card insertion (`wait_for_se_present`)
    pub smart_insertion: bool,
    /// Transport can block on card removal (`wait_for_se_absent`)
    pub smart_presence: bool,
    /// Transport performs application selection itself
    /// (`open_channel_for_aid`)
    pub smart_selection: bool,
}

impl Capabilities {
    /// No optional abilities; polling detection only
    pub const NONE: Self = Self {
        smart_insertion: false,
        smart_presence: false,
        smart_selection: false,
    };

    /// Enable blocking insertion detection
    pub const fn with_smart_insertion(mut self) -> Self {
        self.smart_insertion = true;
        self
    }

    /// Enable blocking removal detection
    pub const fn with_smart_presence(mut self) -> Self {
        self.smart_presence = true;
        self
    }

    /// Enable hardware-side application selection
    pub const fn with_smart_selection(mut self) -> Self {
        self.smart_selection = true;
        self
    }
}

/// Trait implemented by hardware reader bindings
///
/// A transport is responsible for the physical link with one reader slot.
/// It has no knowledge of selection logic, batch semantics or monitoring;
/// those live in the engine layers above.
pub trait SeTransport: Send + Sync + fmt::Debug {
    /// Check whether an SE is currently present
    fn check_presence(&mut self) -> Result<bool, TransportError>;

    /// Answer-To-Reset of the present SE, if available
    fn atr(&mut self) -> Option<Bytes>;

    /// Open the physical channel to the SE
    fn open_physical_channel(&mut self) -> Result<(), TransportError>;

    /// Close the physical channel
    fn close_physical_channel(&mut self) -> Result<(), TransportError>;

    /// Whether the physical channel is currently open
    fn is_physical_channel_open(&self) -> bool;

    /// Send raw APDU bytes to the SE and return the response bytes
    fn transmit_apdu(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        trace!(command = %hex::encode_upper(command), "Transmitting APDU");
        let result = self.do_transmit_apdu(command);
        match &result {
            Ok(response) => {
                trace!(response = %hex::encode_upper(response), "Received APDU response");
            }
            Err(e) => {
                debug!(error = ?e, "Transport error during transmission");
            }
        }
        result
    }

    /// Internal implementation of `transmit_apdu`
    ///
    /// This is the method that concrete implementations should override.
    fn do_transmit_apdu(&mut self, command: &[u8]) -> Result<Bytes, TransportError>;

    /// Whether the currently detected SE speaks the given protocol
    fn protocol_matches(&self, protocol: &SeProtocol) -> Result<bool, TransportError>;

    /// Optional abilities of this transport
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    /// Block until an SE is present or the timeout elapses
    ///
    /// Returns `Ok(true)` on insertion, `Ok(false)` on timeout. Only
    /// meaningful when `capabilities().smart_insertion` is set.
    fn wait_for_se_present(&mut self, _timeout: Duration) -> Result<bool, TransportError> {
        Err(TransportError::Unsupported("wait_for_se_present"))
    }

    /// Block until the SE is removed or the timeout elapses
    ///
    /// Returns `Ok(true)` on removal, `Ok(false)` on timeout. Only
    /// meaningful when `capabilities().smart_presence` is set.
    fn wait_for_se_absent(&mut self, _timeout: Duration) -> Result<bool, TransportError> {
        Err(TransportError::Unsupported("wait_for_se_absent"))
    }

    /// Let selection-capable hardware open the channel for an AID itself
    ///
    /// Only meaningful when `capabilities().smart_selection` is set.
    fn open_channel_for_aid(
        &mut self,
        _selector: &AidSelector,
    ) -> Result<ApduResponse, TransportError> {
        Err(TransportError::Unsupported("open_channel_for_aid"))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable transport used across the engine unit tests

    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Shared mutable state behind a [`MockTransport`]
    #[derive(Debug, Default)]
    pub(crate) struct MockState {
        pub present: bool,
        pub atr: Option<Bytes>,
        pub physical_open: bool,
        pub fail_physical_open: bool,
        pub protocols: Vec<String>,
        pub responses: VecDeque<Result<Bytes, TransportError>>,
        pub commands: Vec<Bytes>,
        pub capabilities: Capabilities,
    }

    /// Scriptable transport; clone the handle to drive state from a test
    #[derive(Debug, Clone)]
    pub(crate) struct MockTransport {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(MockState {
                    present: true,
                    ..MockState::default()
                })),
            }
        }

        pub fn with_atr(atr: &'static [u8]) -> Self {
            let mock = Self::new();
            mock.state.lock().atr = Some(Bytes::from_static(atr));
            mock
        }

        /// Queue a response to return from the next transmission
        pub fn push_response(&self, response: &'static [u8]) {
            self.state
                .lock()
                .responses
                .push_back(Ok(Bytes::from_static(response)));
        }

        /// Queue a transmission failure
        pub fn push_error(&self, error: TransportError) {
            self.state.lock().responses.push_back(Err(error));
        }

        /// Commands transmitted so far
        pub fn commands(&self) -> Vec<Bytes> {
            self.state.lock().commands.clone()
        }
    }

    impl SeTransport for MockTransport {
        fn check_presence(&mut self) -> Result<bool, TransportError> {
            Ok(self.state.lock().present)
        }

        fn atr(&mut self) -> Option<Bytes> {
            self.state.lock().atr.clone()
        }

        fn open_physical_channel(&mut self) -> Result<(), TransportError> {
            let mut state = self.state.lock();
            if state.fail_physical_open {
                return Err(TransportError::Connection);
            }
            state.physical_open = true;
            Ok(())
        }

        fn close_physical_channel(&mut self) -> Result<(), TransportError> {
            self.state.lock().physical_open = false;
            Ok(())
        }

        fn is_physical_channel_open(&self) -> bool {
            self.state.lock().physical_open
        }

        fn do_transmit_apdu(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
            let mut state = self.state.lock();
            state.commands.push(Bytes::copy_from_slice(command));
            state
                .responses
                .pop_front()
                .unwrap_or(Err(TransportError::Transmission))
        }

        fn protocol_matches(&self, protocol: &SeProtocol) -> Result<bool, TransportError> {
            Ok(self
                .state
                .lock()
                .protocols
                .iter()
                .any(|p| p.as_str() == protocol.as_str()))
        }

        fn capabilities(&self) -> Capabilities {
            self.state.lock().capabilities
        }

        fn wait_for_se_present(&mut self, timeout: Duration) -> Result<bool, TransportError> {
            // Sliced wait so cancellation stays prompt in tests
            let deadline = std::time::Instant::now() + timeout;
            loop {
                if self.state.lock().present {
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
                if !self.state.lock().present {
                    return Ok(true);
                }
                if std::time::Instant::now() >= deadline {
                    return Ok(false);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[test]
    fn test_unsupported_capabilities_by_default() {
        #[derive(Debug)]
        struct Bare;
        impl SeTransport for Bare {
            fn check_presence(&mut self) -> Result<bool, TransportError> {
                Ok(false)
            }
            fn atr(&mut self) -> Option<Bytes> {
                None
            }
            fn open_physical_channel(&mut self) -> Result<(), TransportError> {
                Ok(())
            }
            fn close_physical_channel(&mut self) -> Result<(), TransportError> {
                Ok(())
            }
            fn is_physical_channel_open(&self) -> bool {
                false
            }
            fn do_transmit_apdu(&mut self, _: &[u8]) -> Result<Bytes, TransportError> {
                Ok(Bytes::from_static(&[0x90, 0x00]))
            }
            fn protocol_matches(&self, _: &SeProtocol) -> Result<bool, TransportError> {
                Ok(true)
            }
        }

        let mut bare = Bare;
        assert_eq!(bare.capabilities(), Capabilities::NONE);
        assert!(matches!(
            bare.wait_for_se_present(Duration::from_millis(1)),
            Err(TransportError::Unsupported(_))
        ));
    }

    #[test]
    fn test_mock_scripted_responses() {
        let mock = MockTransport::new();
        mock.push_response(&[0x90, 0x00]);
        mock.push_error(TransportError::Transmission);

        let mut transport = mock.clone();
        assert_eq!(
            transport.transmit_apdu(&[0x00, 0xB0, 0x00, 0x00]).unwrap(),
            Bytes::from_static(&[0x90, 0x00])
        );
        assert!(transport.transmit_apdu(&[0x00, 0xB0, 0x00, 0x00]).is_err());
        assert_eq!(mock.commands().len(), 2);
    }
}
