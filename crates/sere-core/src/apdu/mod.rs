//! APDU command and response primitives
//!
//! Types for the basic command/response unit exchanged with a secure
//! element according to ISO/IEC 7816-4. The engine layers above work with
//! [`ApduRequest`]/[`ApduResponse`] pairs; [`Command`] is the builder used
//! to assemble wire bytes for protocol-internal commands such as SELECT
//! APPLICATION and GET RESPONSE.

pub mod status;

use std::collections::BTreeSet;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
pub use status::StatusWord;

/// A single APDU command to transmit to the SE
///
/// Carries the raw wire bytes plus the case-4 flag: a case-4 command both
/// sends and expects data, which some cards acknowledge with a bare success
/// status and no data in the first exchange. The channel engine corrects
/// those with a follow-up GET RESPONSE.
#[derive(Clone, PartialEq, Eq)]
pub struct ApduRequest {
    bytes: Bytes,
    case4: bool,
}

impl ApduRequest {
    /// Create a request from raw APDU bytes
    pub const fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            case4: false,
        }
    }

    /// Mark this request as a case-4 command
    pub const fn case4(mut self) -> Self {
        self.case4 = true;
        self
    }

    /// Raw wire bytes of the command
    pub const fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Whether this command both sends and expects data
    pub const fn is_case4(&self) -> bool {
        self.case4
    }
}

impl From<Command> for ApduRequest {
    fn from(command: Command) -> Self {
        Self::new(command.to_bytes())
    }
}

impl fmt::Debug for ApduRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApduRequest")
            .field("bytes", &hex::encode_upper(&self.bytes))
            .field("case4", &self.case4)
            .finish()
    }
}

/// A single APDU response received from the SE
#[derive(Clone, PartialEq, Eq)]
pub struct ApduResponse {
    payload: Option<Bytes>,
    status: StatusWord,
}

impl ApduResponse {
    /// Create a response from payload and status
    pub fn new(payload: Option<Bytes>, status: impl Into<StatusWord>) -> Self {
        Self {
            payload,
            status: status.into(),
        }
    }

    /// Create a success (90 00) response
    pub const fn success(payload: Option<Bytes>) -> Self {
        Self {
            payload,
            status: StatusWord::new(0x90, 0x00),
        }
    }

    /// Parse a response from raw bytes (payload followed by SW1 SW2)
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 2 {
            return Err(Error::Parse("response shorter than a status word"));
        }
        let len = data.len();
        let status = StatusWord::new(data[len - 2], data[len - 1]);
        let payload = if len > 2 {
            Some(Bytes::copy_from_slice(&data[..len - 2]))
        } else {
            None
        };
        Ok(Self { payload, status })
    }

    /// Response payload without the status word
    pub const fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Status word of the response
    pub const fn status(&self) -> StatusWord {
        self.status
    }

    /// Check whether the status is in the accepted set
    ///
    /// An empty set accepts only 90 00.
    pub fn successful(&self, accepted: &BTreeSet<u16>) -> bool {
        if accepted.is_empty() {
            self.status.is_success()
        } else {
            accepted.contains(&self.status.to_u16())
        }
    }

    /// Check if the response indicates plain success (90 00)
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Replace the status word, keeping the payload
    pub(crate) const fn with_status(mut self, status: StatusWord) -> Self {
        self.status = status;
        self
    }
}

impl From<ApduResponse> for Bytes {
    fn from(response: ApduResponse) -> Self {
        let mut buf =
            BytesMut::with_capacity(response.payload.as_ref().map_or(0, |p| p.len()) + 2);
        if let Some(payload) = response.payload {
            buf.put_slice(&payload);
        }
        buf.put_u8(response.status.sw1);
        buf.put_u8(response.status.sw2);
        buf.freeze()
    }
}

impl fmt::Debug for ApduResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApduResponse")
            .field(
                "payload",
                &self.payload.as_ref().map(|p| hex::encode_upper(p)),
            )
            .field("status", &format_args!("{}", self.status))
            .finish()
    }
}

/// Builder for APDU command wire bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Option<Bytes>,
    le: Option<u8>,
}

impl Command {
    /// Create a new command with the given header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    /// Attach command data (Lc is derived from the length)
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the expected response length (Le)
    pub const fn with_le(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    /// Serialize to wire bytes: CLA INS P1 P2 [Lc data] [Le]
    pub fn to_bytes(&self) -> Bytes {
        let data_len = self.data.as_ref().map_or(0, |d| d.len());
        let mut buffer = BytesMut::with_capacity(
            4 + if data_len > 0 { 1 + data_len } else { 0 } + usize::from(self.le.is_some()),
        );
        buffer.put_u8(self.cla);
        buffer.put_u8(self.ins);
        buffer.put_u8(self.p1);
        buffer.put_u8(self.p2);
        if let Some(data) = &self.data {
            buffer.put_u8(data.len() as u8);
            buffer.put_slice(data);
        }
        if let Some(le) = self.le {
            buffer.put_u8(le);
        }
        buffer.freeze()
    }
}

/// The GET RESPONSE command used for case-4 correction, fixed wire bytes
pub(crate) const GET_RESPONSE: [u8; 5] = [0x00, 0xC0, 0x00, 0x00, 0x00];
