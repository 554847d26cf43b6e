//! Selectors deciding whether and how a logical channel is opened
//!
//! A [`SeSelector`] combines an optional protocol filter, an optional ATR
//! filter and an optional AID selector. The channel engine evaluates them in
//! that order; the outcome of a selection is a [`SelectionStatus`], where
//! `matched == false` is a normal negative result, not an error.

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;

use crate::apdu::{ApduResponse, Command};
use crate::error::Error;

/// Protocol tag detected by the reader hardware (e.g. ISO 14443-4, Mifare)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeProtocol(String);

impl SeProtocol {
    /// Create a protocol tag
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The tag string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SeProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SeProtocol {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Filter matching the ATR of the inserted SE
///
/// The pattern is compared byte for byte against the ATR, optionally under a
/// mask: a mask byte of `0x00` ignores the corresponding ATR byte, `0xFF`
/// requires equality. Lengths must agree for a match.
#[derive(Clone, PartialEq, Eq)]
pub struct AtrFilter {
    pattern: Bytes,
    mask: Option<Bytes>,
}

impl AtrFilter {
    /// Create a filter requiring byte equality with the pattern
    pub const fn new(pattern: Bytes) -> Self {
        Self {
            pattern,
            mask: None,
        }
    }

    /// Attach a mask selecting which pattern bits are significant
    pub fn with_mask(mut self, mask: Bytes) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Test whether an ATR passes this filter
    pub fn matches(&self, atr: &[u8]) -> bool {
        if atr.len() != self.pattern.len() {
            return false;
        }
        match &self.mask {
            Some(mask) if mask.len() == self.pattern.len() => atr
                .iter()
                .zip(self.pattern.iter())
                .zip(mask.iter())
                .all(|((a, p), m)| a & m == p & m),
            _ => atr == self.pattern,
        }
    }
}

impl fmt::Debug for AtrFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtrFilter")
            .field("pattern", &hex::encode_upper(&self.pattern))
            .field("mask", &self.mask.as_ref().map(|m| hex::encode_upper(m)))
            .finish()
    }
}

/// AID-based application selector
///
/// Builds the SELECT APPLICATION command and declares which status words
/// count as a successful selection (90 00 plus any extra codes, e.g. 62 83
/// for an invalidated but selectable application).
#[derive(Clone, PartialEq, Eq)]
pub struct AidSelector {
    aid: Bytes,
    select_next: bool,
    successful_statuses: BTreeSet<u16>,
}

/// Minimum AID length per ISO/IEC 7816-4
pub const AID_MIN_LENGTH: usize = 5;
/// Maximum AID length per ISO/IEC 7816-4
pub const AID_MAX_LENGTH: usize = 16;

impl AidSelector {
    /// Create a selector for the given AID
    ///
    /// Fails if the AID length is outside the 5..=16 byte ISO range.
    pub fn new(aid: impl Into<Bytes>) -> Result<Self, Error> {
        let aid = aid.into();
        if aid.len() < AID_MIN_LENGTH || aid.len() > AID_MAX_LENGTH {
            return Err(Error::InvalidArgument("AID must be 5 to 16 bytes"));
        }
        Ok(Self {
            aid,
            select_next: false,
            successful_statuses: BTreeSet::new(),
        })
    }

    /// Request selection of the next matching occurrence (P2 = 02)
    pub const fn select_next(mut self) -> Self {
        self.select_next = true;
        self
    }

    /// Add a status word accepted as successful selection
    pub fn accept_status(mut self, status: u16) -> Self {
        self.successful_statuses.insert(status);
        self
    }

    /// The application identifier bytes
    pub const fn aid(&self) -> &Bytes {
        &self.aid
    }

    /// Whether select-next was requested
    pub const fn is_select_next(&self) -> bool {
        self.select_next
    }

    /// Status words accepted as successful selection (empty means 90 00 only)
    pub const fn successful_statuses(&self) -> &BTreeSet<u16> {
        &self.successful_statuses
    }

    /// Build the SELECT APPLICATION command for this selector
    ///
    /// Wire format: `00 A4 04 {00|02} Lc <AID> 00`.
    pub fn select_command(&self) -> Command {
        let p2 = if self.select_next { 0x02 } else { 0x00 };
        Command::new(0x00, 0xA4, 0x04, p2)
            .with_data(self.aid.clone())
            .with_le(0x00)
    }

    /// Check whether `candidate` continues the currently selected AID
    ///
    /// True when the current AID is a byte prefix of the candidate (or
    /// equal); reselection is required otherwise.
    pub fn continues(current: &[u8], candidate: &[u8]) -> bool {
        candidate.len() >= current.len() && &candidate[..current.len()] == current
    }
}

impl fmt::Debug for AidSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AidSelector")
            .field("aid", &hex::encode_upper(&self.aid))
            .field("select_next", &self.select_next)
            .field("successful_statuses", &self.successful_statuses)
            .finish()
    }
}

/// Combined selector driving logical channel opening
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeSelector {
    protocol: Option<SeProtocol>,
    atr_filter: Option<AtrFilter>,
    aid_selector: Option<AidSelector>,
}

impl SeSelector {
    /// Create an empty selector accepting any SE
    pub const fn new() -> Self {
        Self {
            protocol: None,
            atr_filter: None,
            aid_selector: None,
        }
    }

    /// Restrict to a reader-detected protocol
    pub fn with_protocol(mut self, protocol: impl Into<SeProtocol>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Restrict to SEs whose ATR passes the filter
    pub fn with_atr_filter(mut self, filter: AtrFilter) -> Self {
        self.atr_filter = Some(filter);
        self
    }

    /// Select an application by AID
    pub fn with_aid_selector(mut self, selector: AidSelector) -> Self {
        self.aid_selector = Some(selector);
        self
    }

    /// The protocol filter, if any
    pub const fn protocol(&self) -> Option<&SeProtocol> {
        self.protocol.as_ref()
    }

    /// The ATR filter, if any
    pub const fn atr_filter(&self) -> Option<&AtrFilter> {
        self.atr_filter.as_ref()
    }

    /// The AID selector, if any
    pub const fn aid_selector(&self) -> Option<&AidSelector> {
        self.aid_selector.as_ref()
    }
}

/// Outcome of a selection attempt
///
/// Holds whatever identification data was gathered: the ATR read during
/// physical channel activation and/or the FCI returned by SELECT
/// APPLICATION. At least one of the two is always present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionStatus {
    atr: Option<Bytes>,
    fci: Option<ApduResponse>,
    matched: bool,
}

impl SelectionStatus {
    /// Create a selection status
    ///
    /// Fails if neither an ATR nor an FCI is provided.
    pub fn new(
        atr: Option<Bytes>,
        fci: Option<ApduResponse>,
        matched: bool,
    ) -> Result<Self, Error> {
        if atr.is_none() && fci.is_none() {
            return Err(Error::InvalidArgument(
                "selection status requires an ATR or an FCI",
            ));
        }
        Ok(Self { atr, fci, matched })
    }

    /// The ATR captured during selection, if read
    pub const fn atr(&self) -> Option<&Bytes> {
        self.atr.as_ref()
    }

    /// The FCI returned by the selection command, if one was sent
    pub const fn fci(&self) -> Option<&ApduResponse> {
        self.fci.as_ref()
    }

    /// Whether all present filters passed
    pub const fn has_matched(&self) -> bool {
        self.matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atr_filter_exact() {
        let filter = AtrFilter::new(Bytes::from_static(&[0x00, 0x00]));
        assert!(filter.matches(&[0x00, 0x00]));
        assert!(!filter.matches(&[0x10, 0x00]));
        assert!(!filter.matches(&[0x00, 0x00, 0x00]));
    }

    #[test]
    fn test_atr_filter_masked() {
        // Only the high nibble of the first byte is significant
        let filter = AtrFilter::new(Bytes::from_static(&[0x3B, 0x00]))
            .with_mask(Bytes::from_static(&[0xF0, 0x00]));
        assert!(filter.matches(&[0x3F, 0xAA]));
        assert!(!filter.matches(&[0x4B, 0xAA]));
    }

    #[test]
    fn test_aid_length_bounds() {
        assert!(AidSelector::new(Bytes::from_static(&[0xA0; 4])).is_err());
        assert!(AidSelector::new(Bytes::from_static(&[0xA0; 17])).is_err());
        assert!(AidSelector::new(Bytes::from_static(&[0xA0; 5])).is_ok());
        assert!(AidSelector::new(Bytes::from_static(&[0xA0; 16])).is_ok());
    }

    #[test]
    fn test_select_command_wire_format() {
        let selector = AidSelector::new(Bytes::from_static(&[0xA0, 0x00, 0x00, 0x01, 0x51]))
            .unwrap();
        assert_eq!(
            selector.select_command().to_bytes().as_ref(),
            &[0x00, 0xA4, 0x04, 0x00, 0x05, 0xA0, 0x00, 0x00, 0x01, 0x51, 0x00]
        );

        let selector = AidSelector::new(Bytes::from_static(&[0xA0, 0x00, 0x00, 0x01, 0x51]))
            .unwrap()
            .select_next();
        assert_eq!(selector.select_command().to_bytes()[3], 0x02);
    }

    #[test]
    fn test_aid_continuity() {
        let current = [0xA0, 0x00, 0x00, 0x01, 0x51];
        assert!(AidSelector::continues(&current, &current));
        assert!(AidSelector::continues(
            &current,
            &[0xA0, 0x00, 0x00, 0x01, 0x51, 0x00, 0x01]
        ));
        assert!(!AidSelector::continues(
            &current,
            &[0xA0, 0x00, 0x00, 0x01, 0x52]
        ));
        assert!(!AidSelector::continues(&current, &[0xA0, 0x00]));
    }

    #[test]
    fn test_selection_status_requires_identification() {
        assert!(SelectionStatus::new(None, None, true).is_err());
        assert!(
            SelectionStatus::new(Some(Bytes::from_static(&[0x3B])), None, true).is_ok()
        );
    }
}
