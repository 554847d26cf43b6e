//! Channel lifecycle and application selection engine
//!
//! [`ChannelEngine`] owns the transport of exactly one reader together with
//! its channel state: whether the logical channel is open, which AID is
//! currently selected and the cached [`SelectionStatus`]. The logical
//! channel is layered over the physical channel; the engine maintains the
//! invariant that a logical channel is only ever open on top of an open
//! physical channel.
//!
//! IO failures during transmission force-close the logical channel before
//! the error surfaces, so a caller never observes a half-valid selection.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::apdu::{ApduRequest, ApduResponse, GET_RESPONSE};
use crate::error::{ChannelError, Error, SelectionError};
use crate::selection::{AidSelector, SeSelector, SelectionStatus};
use crate::transport::SeTransport;

/// Channel state and selection engine for one reader
#[derive(Debug)]
pub struct ChannelEngine<T: SeTransport> {
    transport: T,
    logical_open: bool,
    selected_aid: Option<Bytes>,
    selection_status: Option<SelectionStatus>,
}

impl<T: SeTransport> ChannelEngine<T> {
    /// Create an engine around a transport with all channels closed
    pub const fn new(transport: T) -> Self {
        Self {
            transport,
            logical_open: false,
            selected_aid: None,
            selection_status: None,
        }
    }

    /// Get a reference to the underlying transport
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Get a mutable reference to the underlying transport
    pub const fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Whether the logical channel is open
    pub const fn is_logical_channel_open(&self) -> bool {
        self.logical_open
    }

    /// Whether an SE is currently present
    pub fn is_se_present(&mut self) -> Result<bool, Error> {
        Ok(self.transport.check_presence()?)
    }

    /// Open the logical channel according to the selector, reusing the
    /// current selection when it is still valid
    ///
    /// When the logical channel is already open the cached selection status
    /// is returned, unless the selector targets an AID that requires
    /// reselection: a select-next request, or an AID that is not a
    /// byte-prefix extension of the currently selected one. In that case
    /// the logical channel is closed first and selection runs again.
    pub fn open_logical_channel_and_select(
        &mut self,
        selector: &SeSelector,
    ) -> Result<SelectionStatus, Error> {
        if self.logical_open {
            match (selector.aid_selector(), &self.selection_status) {
                (Some(aid_selector), Some(cached)) => {
                    if self.aid_continues(aid_selector) {
                        trace!("Logical channel open and AID continues, reusing selection");
                        return Ok(cached.clone());
                    }
                    debug!("AID discontinuity, closing logical channel for reselection");
                    self.close_logical_channel();
                }
                (None, Some(cached)) => {
                    trace!("Logical channel open, reusing selection");
                    return Ok(cached.clone());
                }
                // Open channel without a cached status is stale state left
                // by a failed exchange; reselect from scratch.
                _ => self.close_logical_channel(),
            }
        }

        if !self.transport.is_physical_channel_open() {
            self.transport
                .open_physical_channel()
                .map_err(ChannelError::PhysicalOpen)?;
        }

        self.open_logical_channel(selector)
    }

    /// Run the selection protocol on a freshly opened channel
    ///
    /// Filter evaluation order:
    /// 1. ATR filter, if present. With no AID selector the ATR match result
    ///    is the selection result and no APDU is exchanged. A failing ATR
    ///    filter short-circuits: a present AID selector is NOT attempted,
    ///    so no APDU ever reaches an SE the caller's ATR predicate
    ///    rejected.
    /// 2. AID selector, if present: SELECT APPLICATION is sent and the
    ///    match result is whether the response status is in the selector's
    ///    accepted set.
    /// 3. Neither filter: the selection trivially matches.
    fn open_logical_channel(
        &mut self,
        selector: &SeSelector,
    ) -> Result<SelectionStatus, Error> {
        let atr = self.transport.atr();

        if let Some(filter) = selector.atr_filter() {
            let atr_bytes = atr.clone().ok_or(ChannelError::AtrUnavailable)?;
            if !filter.matches(&atr_bytes) {
                debug!(atr = %hex::encode_upper(&atr_bytes), "ATR filter did not match");
                self.close_logical_channel();
                return SelectionStatus::new(Some(atr_bytes), None, false);
            }
            if selector.aid_selector().is_none() {
                let status = SelectionStatus::new(Some(atr_bytes), None, true)?;
                self.set_selected(None, &status);
                return Ok(status);
            }
        }

        if let Some(aid_selector) = selector.aid_selector() {
            let fci = self.select_application(aid_selector)?;
            let matched = fci.successful(aid_selector.successful_statuses());
            let status = SelectionStatus::new(atr, Some(fci), matched)?;
            if matched {
                self.set_selected(Some(aid_selector.aid().clone()), &status);
            } else {
                self.close_logical_channel();
            }
            return Ok(status);
        }

        // No filter at all: any SE is accepted
        let atr_bytes = atr.ok_or(ChannelError::AtrUnavailable)?;
        let status = SelectionStatus::new(Some(atr_bytes), None, true)?;
        self.set_selected(None, &status);
        Ok(status)
    }

    /// Send SELECT APPLICATION, either through selection-capable hardware
    /// or as a plain case-4 exchange
    fn select_application(
        &mut self,
        aid_selector: &AidSelector,
    ) -> Result<ApduResponse, Error> {
        if self.transport.capabilities().smart_selection {
            return self
                .transport
                .open_channel_for_aid(aid_selector)
                .map_err(|e| {
                    self.close_logical_channel();
                    SelectionError::Exchange(e).into()
                });
        }

        let request = ApduRequest::from(aid_selector.select_command()).case4();
        match self.transmit_apdu(&request) {
            Ok(response) => Ok(response),
            Err(Error::Transport(e)) => Err(SelectionError::Exchange(e).into()),
            Err(Error::Parse(_)) => Err(SelectionError::MalformedResponse.into()),
            Err(e) => Err(e),
        }
    }

    /// Transmit a single APDU, applying the case-4 correction
    ///
    /// Some cards acknowledge a case-4 command with a bare success status
    /// and no data. When that happens exactly one GET RESPONSE follow-up is
    /// issued and its payload is returned under the ORIGINAL status word.
    pub fn transmit_apdu(&mut self, request: &ApduRequest) -> Result<ApduResponse, Error> {
        let response_bytes = self.transmit_or_close(request.bytes())?;
        let response = ApduResponse::from_bytes(&response_bytes)?;

        if request.is_case4() && response.payload().is_none() && response.is_success() {
            trace!("Case-4 command returned no data, issuing GET RESPONSE");
            let fetched_bytes = self.transmit_or_close(&GET_RESPONSE)?;
            let fetched = ApduResponse::from_bytes(&fetched_bytes)?;
            // Splice the original status word onto the fetched data
            return Ok(fetched.with_status(response.status()));
        }

        Ok(response)
    }

    /// Close the logical channel and forget the cached selection
    pub fn close_logical_channel(&mut self) {
        self.logical_open = false;
        self.selected_aid = None;
        self.selection_status = None;
    }

    /// Close both channels
    pub fn close_physical_channel(&mut self) -> Result<(), Error> {
        self.close_logical_channel();
        self.transport.close_physical_channel()?;
        Ok(())
    }

    /// Reset all channel state after presence loss, ignoring transport
    /// failures from the already-absent SE
    pub(crate) fn reset_on_removal(&mut self) {
        self.close_logical_channel();
        if let Err(e) = self.transport.close_physical_channel() {
            debug!(error = ?e, "Closing physical channel after removal failed");
        }
    }

    fn transmit_or_close(&mut self, command: &[u8]) -> Result<Bytes, Error> {
        self.transport.transmit_apdu(command).map_err(|e| {
            // Fail safe: never leave a logical channel open over a broken link
            self.close_logical_channel();
            e.into()
        })
    }

    fn aid_continues(&self, aid_selector: &AidSelector) -> bool {
        if aid_selector.is_select_next() {
            return false;
        }
        match &self.selected_aid {
            Some(current) => AidSelector::continues(current, aid_selector.aid()),
            None => false,
        }
    }

    fn set_selected(&mut self, aid: Option<Bytes>, status: &SelectionStatus) {
        self.logical_open = true;
        self.selected_aid = aid;
        self.selection_status = Some(status.clone());
    }
}
