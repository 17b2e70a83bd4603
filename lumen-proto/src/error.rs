//! Wire error codes (`spec.md` §6.4) and codec-level parse failures.

use std::fmt;

/// Error codes carried in a `FAIL` message's `error_code` byte.
///
/// Values outside the known range are preserved as [`ErrorCode::Unrecognized`]
/// rather than rejected, since a peer running a newer protocol minor version
/// may send a code this build doesn't know about yet — the receiving side
/// still needs to be able to display *something*.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// `ENQUEUE` received while the sink was not lent to anyone.
    NotBorrowed,
    /// Requested ring capacity exceeds the sink's preconfigured upper bound.
    RequestedBufferTooLarge,
    /// Requested `frame_duration_ms` is below the sink's minimum (10ms).
    RequestedFrameDurationTooShort,
    /// The sink is currently lent to a different source.
    LentToOtherSource,
    /// Malformed message (unknown tag, or an `ENQUEUE` payload under 3 bytes).
    BadMsg,
    /// No packet received from the borrower within the drop timeout.
    Timeout,
    /// A code this build does not recognize.
    Unrecognized(u8),
}

impl From<u8> for ErrorCode {
    fn from(byte: u8) -> Self {
        match byte {
            1 => ErrorCode::NotBorrowed,
            2 => ErrorCode::RequestedBufferTooLarge,
            3 => ErrorCode::RequestedFrameDurationTooShort,
            4 => ErrorCode::LentToOtherSource,
            5 => ErrorCode::BadMsg,
            6 => ErrorCode::Timeout,
            other => ErrorCode::Unrecognized(other),
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::NotBorrowed => 1,
            ErrorCode::RequestedBufferTooLarge => 2,
            ErrorCode::RequestedFrameDurationTooShort => 3,
            ErrorCode::LentToOtherSource => 4,
            ErrorCode::BadMsg => 5,
            ErrorCode::Timeout => 6,
            ErrorCode::Unrecognized(other) => other,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::NotBorrowed => write!(f, "not borrowed"),
            ErrorCode::RequestedBufferTooLarge => write!(f, "requested buffer too large"),
            ErrorCode::RequestedFrameDurationTooShort => {
                write!(f, "requested frame duration too short")
            }
            ErrorCode::LentToOtherSource => write!(f, "lent to another source"),
            ErrorCode::BadMsg => write!(f, "bad message"),
            ErrorCode::Timeout => write!(f, "timeout"),
            ErrorCode::Unrecognized(code) => write!(f, "unrecognized error code {code}"),
        }
    }
}

/// A message that could not be decoded from a datagram buffer.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    /// Fewer than 5 bytes remain, so not even a header fits.
    #[error("truncated message header at offset {offset}")]
    TruncatedHeader { offset: usize },
    /// The header's `payload_len` claims more bytes than remain in the buffer.
    #[error("message at offset {offset} declares payload_len {payload_len} but only {remaining} bytes remain")]
    PayloadOverrun {
        offset: usize,
        payload_len: u16,
        remaining: usize,
    },
    /// The type tag is not one of `{0x00, 0x01, 0x02, 0xFF}`.
    #[error("unknown message type tag {tag:#04x} (msg_id {msg_id})")]
    UnknownTag { msg_id: u16, tag: u8 },
    /// An `ENQUEUE` payload was shorter than the 3-byte minimum header.
    #[error("enqueue payload too short ({payload_len} bytes, need at least 3) (msg_id {msg_id})")]
    ShortEnqueuePayload { msg_id: u16, payload_len: u16 },
}
