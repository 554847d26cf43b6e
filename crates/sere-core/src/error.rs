//! Error types for reader and transmission operations
//!
//! Errors are split per concern and composed into a single [`Error`] used by
//! the engine-level APIs. A non-matching selection is a normal negative
//! result and is never reported through these types.

use crate::batch::SeResponse;
use crate::transport::TransportError;

/// Top-level error for engine operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Physical or logical channel could not be established
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Application selection failed at the protocol level
    #[error(transparent)]
    Selection(#[from] SelectionError),

    /// Transport-level transmission failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A batch or request was interrupted with partial results collected
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// Monitoring lifecycle misuse
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    /// Parse error when processing response bytes
    #[error("Parse error: {0}")]
    Parse(&'static str),

    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Errors raised while establishing or using a channel
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The physical channel could not be opened
    #[error("Failed to open physical channel")]
    PhysicalOpen(#[source] TransportError),

    /// The transport could not provide an ATR although one was required
    #[error("ATR unavailable from transport")]
    AtrUnavailable,
}

/// Errors raised by the application selection exchange
///
/// Distinct from a non-matching selection, which is reported through
/// [`SelectionStatus::matched`](crate::selection::SelectionStatus).
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    /// The SELECT APPLICATION exchange itself failed
    #[error("Application selection exchange failed")]
    Exchange(#[source] TransportError),

    /// The selection response could not be parsed
    #[error("Malformed selection response")]
    MalformedResponse,
}

/// Error carrying the maximal successfully-collected result of an
/// interrupted batch
///
/// Callers can always retrieve partial data from the failure path: the
/// response sequence holds one entry per request attempted so far, the last
/// one populated with the APDU responses exchanged before the failure.
#[derive(Debug, thiserror::Error)]
#[error("Transmission failed after {} collected response(s)", .responses.len())]
pub struct BatchError {
    /// Responses collected before the failure, in request order
    pub responses: Vec<Option<SeResponse>>,
    /// The failure that interrupted processing
    #[source]
    pub source: Box<Error>,
}

impl BatchError {
    /// Create a partial-result error from collected responses and a cause
    pub fn new(responses: Vec<Option<SeResponse>>, source: Error) -> Self {
        Self {
            responses,
            source: Box::new(source),
        }
    }
}

/// Monitoring lifecycle errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    /// Detection was started while already running
    #[error("SE detection already started")]
    AlreadyStarted,

    /// An operation required detection to be running
    #[error("SE detection not started")]
    NotStarted,
}
