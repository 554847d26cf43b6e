//! Ordered multi-request transmission with partial-failure collection
//!
//! A batch is an ordered sequence of [`SeRequest`]s executed against one
//! reader. Each request first passes a protocol-applicability check, then
//! runs selection and its APDU list through the channel engine. Failure
//! carries the maximal collected result at two levels: the APDU prefix of
//! the failing request and the response prefix of the batch, both inside
//! [`BatchError`].

use tracing::{debug, trace};

use crate::apdu::{ApduRequest, ApduResponse};
use crate::channel::ChannelEngine;
use crate::error::{BatchError, Error};
use crate::selection::{SeSelector, SelectionStatus};
use crate::transport::SeTransport;

/// Execution-stop policy for a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Stop after the first request whose selection matched, returning the
    /// responses collected up to and including it
    FirstMatch,
    /// Process every request regardless of prior outcomes (hard
    /// transmission errors still stop the batch)
    ProcessAll,
}

/// One request of a batch: optional selection plus an ordered APDU list
#[derive(Debug, Clone)]
pub struct SeRequest {
    selector: Option<SeSelector>,
    apdus: Vec<ApduRequest>,
    keep_channel_open: bool,
}

impl SeRequest {
    /// Create a request running the given APDUs on the current channel
    pub const fn new(apdus: Vec<ApduRequest>) -> Self {
        Self {
            selector: None,
            apdus,
            keep_channel_open: false,
        }
    }

    /// Attach a selector deciding whether/how the channel is opened
    pub fn with_selector(mut self, selector: SeSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Keep the channel open after this request
    pub const fn keep_channel_open(mut self) -> Self {
        self.keep_channel_open = true;
        self
    }

    /// The selector, if any
    pub const fn selector(&self) -> Option<&SeSelector> {
        self.selector.as_ref()
    }

    /// The ordered APDU list
    pub fn apdus(&self) -> &[ApduRequest] {
        &self.apdus
    }

    /// Whether the channel stays open after this request
    pub const fn keeps_channel_open(&self) -> bool {
        self.keep_channel_open
    }
}

/// Result of one executed request
#[derive(Debug, Clone)]
pub struct SeResponse {
    channel_open: bool,
    selection_status: Option<SelectionStatus>,
    apdu_responses: Vec<ApduResponse>,
}

impl SeResponse {
    /// Create a response
    pub const fn new(
        channel_open: bool,
        selection_status: Option<SelectionStatus>,
        apdu_responses: Vec<ApduResponse>,
    ) -> Self {
        Self {
            channel_open,
            selection_status,
            apdu_responses,
        }
    }

    /// Whether the logical channel was open when processing finished
    pub const fn channel_open(&self) -> bool {
        self.channel_open
    }

    /// The selection outcome, absent for selector-less requests
    pub const fn selection_status(&self) -> Option<&SelectionStatus> {
        self.selection_status.as_ref()
    }

    /// Responses to the request's APDUs, in order
    ///
    /// Shorter than the request's APDU list when the request was
    /// interrupted by a transmission failure.
    pub fn apdu_responses(&self) -> &[ApduResponse] {
        &self.apdu_responses
    }

    /// Whether this request's selection matched (selector-less requests
    /// count as matched when the channel was usable)
    fn matched(&self) -> bool {
        self.selection_status
            .as_ref()
            .map_or(self.channel_open, SelectionStatus::has_matched)
    }
}

// Failure of a single request, carrying its partial response
struct RequestFailure {
    partial: SeResponse,
    source: Error,
}

impl<T: SeTransport> ChannelEngine<T> {
    /// Execute one request, with partial-result semantics
    ///
    /// Convenience wrapper over [`transmit_set`](Self::transmit_set) for a
    /// single request; a `None` result means the request's protocol filter
    /// did not match the inserted SE.
    pub fn transmit(&mut self, request: &SeRequest) -> Result<Option<SeResponse>, Error> {
        if !self.request_protocol_matches(request)? {
            return Ok(None);
        }
        match self.process_request(request) {
            Ok(response) => {
                if !request.keeps_channel_open() {
                    self.close_physical_channel()?;
                }
                Ok(Some(response))
            }
            Err(failure) => Err(BatchError::new(
                vec![Some(failure.partial)],
                failure.source,
            )
            .into()),
        }
    }

    /// Execute an ordered batch of requests
    ///
    /// The output holds one slot per attempted request, `None` where the
    /// request's protocol filter did not match the inserted SE. Processing
    /// stops early on:
    /// - the first matching selection in [`ProcessingMode::FirstMatch`],
    /// - a request that keeps its channel open while the logical channel
    ///   ended up open (further selections are precluded),
    /// - a hard transmission error, reported as [`BatchError`] carrying
    ///   every response collected so far including the partially populated
    ///   one of the failing request.
    pub fn transmit_set(
        &mut self,
        requests: &[SeRequest],
        mode: ProcessingMode,
    ) -> Result<Vec<Option<SeResponse>>, Error> {
        // Protocol applicability is evaluated up front so the channel
        // closing policy can know which request is the last matching one.
        let mut applicable = Vec::with_capacity(requests.len());
        for request in requests {
            applicable.push(self.request_protocol_matches(request)?);
        }

        let mut responses: Vec<Option<SeResponse>> = Vec::with_capacity(requests.len());

        for (index, request) in requests.iter().enumerate() {
            if !applicable[index] {
                trace!(index, "Request protocol does not match, skipping");
                responses.push(None);
                continue;
            }

            let response = match self.process_request(request) {
                Ok(response) => response,
                Err(failure) => {
                    responses.push(Some(failure.partial));
                    debug!(
                        index,
                        collected = responses.len(),
                        "Batch interrupted by transmission failure"
                    );
                    return Err(BatchError::new(responses, failure.source).into());
                }
            };

            let matched = response.matched();
            let keep_open = request.keeps_channel_open();
            responses.push(Some(response));

            let last_applicable = !applicable[index + 1..].contains(&true);
            let stop = match mode {
                ProcessingMode::FirstMatch => matched,
                ProcessingMode::ProcessAll => {
                    // A persistently open channel precludes further
                    // distinct selections within the same batch.
                    keep_open && self.is_logical_channel_open()
                }
            };

            if !keep_open && (last_applicable || stop) {
                self.close_physical_channel()?;
            }
            if stop || last_applicable {
                break;
            }
        }

        Ok(responses)
    }

    // Process selection plus APDU list for one applicable request.
    fn process_request(&mut self, request: &SeRequest) -> Result<SeResponse, RequestFailure> {
        let mut selection_status = None;

        if let Some(selector) = request.selector() {
            let status = self
                .open_logical_channel_and_select(selector)
                .map_err(|source| RequestFailure {
                    partial: SeResponse::new(false, None, Vec::new()),
                    source,
                })?;
            let matched = status.has_matched();
            selection_status = Some(status);
            if !matched {
                // Normal negative result: no APDU is attempted
                return Ok(SeResponse::new(false, selection_status, Vec::new()));
            }
        }

        let mut apdu_responses = Vec::with_capacity(request.apdus().len());
        for apdu in request.apdus() {
            match self.transmit_apdu(apdu) {
                Ok(response) => apdu_responses.push(response),
                Err(source) => {
                    // The engine already force-closed the logical channel
                    return Err(RequestFailure {
                        partial: SeResponse::new(false, selection_status, apdu_responses),
                        source,
                    });
                }
            }
        }

        Ok(SeResponse::new(
            self.is_logical_channel_open(),
            selection_status,
            apdu_responses,
        ))
    }

    fn request_protocol_matches(&mut self, request: &SeRequest) -> Result<bool, Error> {
        match request.selector().and_then(SeSelector::protocol) {
            Some(protocol) => Ok(self.transport_mut().protocol_matches(protocol)?),
            None => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::selection::AidSelector;
    use crate::transport::TransportError;
    use crate::transport::mock::MockTransport;

    const AID: &[u8] = &[0xA0, 0x00, 0x00, 0x01, 0x51];
    const READ: &[u8] = &[0x00, 0xB2, 0x01, 0x0C];

    fn setup() -> (MockTransport, ChannelEngine<MockTransport>) {
        let mock = MockTransport::with_atr(&[0x3B, 0x00]);
        mock.state.lock().protocols = vec!["ISO_14443_4".into()];
        let engine = ChannelEngine::new(mock.clone());
        (mock, engine)
    }

    fn select_request(apdu_count: usize) -> SeRequest {
        let apdus = (0..apdu_count)
            .map(|_| ApduRequest::new(Bytes::from_static(READ)))
            .collect();
        SeRequest::new(apdus).with_selector(
            SeSelector::new()
                .with_aid_selector(AidSelector::new(Bytes::from_static(AID)).unwrap()),
        )
    }

    fn push_selection_ok(mock: &MockTransport) {
        mock.push_response(&[0x6F, 0x00, 0x90, 0x00]);
    }

    #[test]
    fn test_full_success_counts_match() {
        let (mock, mut engine) = setup();
        push_selection_ok(&mock);
        mock.push_response(&[0x01, 0x90, 0x00]);
        mock.push_response(&[0x02, 0x90, 0x00]);

        let responses = engine
            .transmit_set(&[select_request(2)], ProcessingMode::ProcessAll)
            .unwrap();
        assert_eq!(responses.len(), 1);
        let response = responses[0].as_ref().unwrap();
        assert_eq!(response.apdu_responses().len(), 2);
        assert!(response.selection_status().unwrap().has_matched());
        // Channel closing policy: last matching request, keep-open false
        assert!(!engine.is_logical_channel_open());
    }

    #[test]
    fn test_protocol_mismatch_yields_absent_slot() {
        let (mock, mut engine) = setup();
        // First request targets a protocol the card does not speak
        let mifare = SeRequest::new(Vec::new()).with_selector(
            SeSelector::new()
                .with_protocol("MIFARE_CLASSIC")
                .with_aid_selector(AidSelector::new(Bytes::from_static(AID)).unwrap()),
        );
        push_selection_ok(&mock);
        mock.push_response(&[0x01, 0x90, 0x00]);
        let iso = SeRequest::new(vec![ApduRequest::new(Bytes::from_static(READ))])
            .with_selector(
                SeSelector::new()
                    .with_protocol("ISO_14443_4")
                    .with_aid_selector(AidSelector::new(Bytes::from_static(AID)).unwrap()),
            );

        let responses = engine
            .transmit_set(&[mifare, iso], ProcessingMode::ProcessAll)
            .unwrap();
        assert_eq!(responses.len(), 2);
        assert!(responses[0].is_none());
        assert_eq!(responses[1].as_ref().unwrap().apdu_responses().len(), 1);
    }

    #[test]
    fn test_first_match_short_circuits() {
        let (mock, mut engine) = setup();
        push_selection_ok(&mock);

        let requests = [select_request(0), select_request(0), select_request(0)];
        let responses = engine
            .transmit_set(&requests, ProcessingMode::FirstMatch)
            .unwrap();
        // Only the first matching response is returned
        assert_eq!(responses.len(), 1);
        assert!(responses[0].is_some());
        // A single SELECT went out
        assert_eq!(mock.commands().len(), 1);
    }

    #[test]
    fn test_partial_failure_carries_prefix() {
        let (mock, mut engine) = setup();
        // Request 0: selection + 1 APDU, all fine
        push_selection_ok(&mock);
        mock.push_response(&[0x01, 0x90, 0x00]);
        // Request 1: selection fine, 2 of 4 APDUs succeed, third fails
        push_selection_ok(&mock);
        mock.push_response(&[0x02, 0x90, 0x00]);
        mock.push_response(&[0x03, 0x90, 0x00]);
        mock.push_error(TransportError::Transmission);

        let requests = [select_request(1), select_request(4), select_request(1)];
        let err = engine
            .transmit_set(&requests, ProcessingMode::ProcessAll)
            .unwrap_err();

        let Error::Batch(batch) = err else {
            panic!("expected batch error, got {err:?}");
        };
        // k = 1 failed first: 2 responses collected, the failing one partial
        assert_eq!(batch.responses.len(), 2);
        assert_eq!(batch.responses[0].as_ref().unwrap().apdu_responses().len(), 1);
        let partial = batch.responses[1].as_ref().unwrap();
        assert_eq!(partial.apdu_responses().len(), 2);
        assert!(!partial.channel_open());
        // The third request was never attempted: 2 SELECTs + 4 reads (one failing)
        assert_eq!(mock.commands().len(), 6);
    }

    #[test]
    fn test_keep_open_stops_further_selections() {
        let (mock, mut engine) = setup();
        push_selection_ok(&mock);

        let keep = select_request(0).keep_channel_open();
        let requests = [keep, select_request(0), select_request(0)];
        let responses = engine
            .transmit_set(&requests, ProcessingMode::ProcessAll)
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert!(engine.is_logical_channel_open());
        assert_eq!(mock.commands().len(), 1);
    }

    #[test]
    fn test_unmatched_selection_is_skipped_not_failed() {
        let (mock, mut engine) = setup();
        mock.push_response(&[0x6A, 0x82]); // not found
        push_selection_ok(&mock);
        mock.push_response(&[0x01, 0x90, 0x00]);

        let requests = [select_request(3), select_request(1)];
        let responses = engine
            .transmit_set(&requests, ProcessingMode::ProcessAll)
            .unwrap();
        assert_eq!(responses.len(), 2);
        // Unmatched: selection status kept, no APDU attempted
        let unmatched = responses[0].as_ref().unwrap();
        assert!(!unmatched.selection_status().unwrap().has_matched());
        assert!(unmatched.apdu_responses().is_empty());
        assert_eq!(responses[1].as_ref().unwrap().apdu_responses().len(), 1);
    }

    #[test]
    fn test_single_transmit_protocol_mismatch_is_none() {
        let (_mock, mut engine) = setup();
        let request = SeRequest::new(Vec::new()).with_selector(
            SeSelector::new().with_protocol("MIFARE_CLASSIC"),
        );
        assert!(engine.transmit(&request).unwrap().is_none());
    }
}
