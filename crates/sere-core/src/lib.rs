//! Reader lifecycle and APDU transmission engine for secure elements
//!
//! This crate provides a uniform transmission and lifecycle API over
//! heterogeneous secure element (SE) reader hardware. Concrete reader
//! technologies (PC/SC, NFC adapters, SE OS interfaces) plug in by
//! implementing the [`SeTransport`] capability trait; everything above that
//! seam is hardware independent:
//!
//! - Logical/physical channel management and application selection
//!   (AID/ATR matching) with automatic case-4 GET RESPONSE correction
//! - Ordered multi-request batch transmission with partial-failure
//!   collection and `FIRST_MATCH`/`PROCESS_ALL` semantics
//! - A per-reader monitoring state machine driving insertion detection,
//!   processing and removal detection on a background thread, pluggable
//!   with polling or native blocking detection strategies
//! - A typed event bus carrying reader and plugin events to observers
//!
//! Behavior is composed from a transport's advertised [`Capabilities`]
//! rather than from reader subtypes: a transport that can block on card
//! presence gets the native detection jobs, everything else is polled.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod apdu;
pub mod batch;
pub mod channel;
pub mod error;
pub mod event;
pub mod monitor;
pub mod reader;
pub mod registry;
pub mod selection;
pub mod transport;

pub use apdu::{ApduRequest, ApduResponse, Command, StatusWord};
pub use batch::{ProcessingMode, SeRequest, SeResponse};
pub use channel::ChannelEngine;
pub use error::{BatchError, ChannelError, Error, SelectionError};
pub use event::{EventBus, PluginEvent, ReaderEvent, SubscriptionId};
pub use monitor::{
    DefaultSelection, MonitoringConfig, MonitoringState, NotificationMode, PollingMode,
};
pub use reader::SeReader;
pub use registry::ReaderRegistry;
pub use selection::{AidSelector, AtrFilter, SeProtocol, SeSelector, SelectionStatus};
pub use transport::{Capabilities, SeTransport, TransportError};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{Bytes, BytesMut, Error};

    pub use crate::apdu::{ApduRequest, ApduResponse, Command, StatusWord};
    pub use crate::batch::{ProcessingMode, SeRequest, SeResponse};
    pub use crate::event::{EventBus, PluginEvent, ReaderEvent};
    pub use crate::monitor::{DefaultSelection, MonitoringConfig, NotificationMode, PollingMode};
    pub use crate::reader::SeReader;
    pub use crate::selection::{AidSelector, AtrFilter, SeProtocol, SeSelector};
    pub use crate::transport::{Capabilities, SeTransport, TransportError};
}
