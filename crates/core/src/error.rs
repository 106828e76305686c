//! Error types for the handshake message layer.
//!
//! All operations return structured errors rather than panicking. Each error
//! class maps onto the TLS alert a caller should send before tearing the
//! connection down (see [`Error::alert`]).
//!
//! A blocked transport is not an error: it surfaces as
//! [`FlightStatus::WouldBlock`](crate::flight::FlightStatus::WouldBlock).

use thiserror::Error;

/// Top-level error type for all operations in the system.
///
/// Each variant corresponds to a specific failure domain:
/// - Decode: malformed fragment headers, ranges or records
/// - Protocol: well-formed input the peer was not allowed to send
/// - Resource: size limits and allocation failures
/// - MTU / timeout: fatal transmission conditions
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input from the peer
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Input that violates the handshake message rules
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Size limit or allocation failure
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    /// The configured MTU leaves no room for even one fragment byte
    #[error("MTU of {mtu} bytes cannot carry a handshake fragment")]
    MtuTooSmall { mtu: usize },

    /// Retransmission limit exceeded
    #[error("handshake timed out after {timeouts} retransmissions")]
    TimedOut { timeouts: u32 },

    /// Broken internal invariant or misuse of a collaborator
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// Transport I/O error other than would-block
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors parsing handshake fragments and records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes for the 12-byte fragment header
    #[error("fragment header too short: need {required} bytes, got {actual}")]
    TruncatedHeader { required: usize, actual: usize },

    /// Header claims more body bytes than the record holds
    #[error("fragment body too short: header says {expected}, got {actual}")]
    TruncatedBody { expected: usize, actual: usize },

    /// `frag_off + frag_len` runs past the declared message length
    #[error("fragment [{frag_off}, +{frag_len}) exceeds message length {msg_len}")]
    FragmentOutOfRange {
        frag_off: u32,
        frag_len: u32,
        msg_len: u32,
    },

    /// Declared message length above the configured maximum
    #[error("message length {msg_len} exceeds maximum {max}")]
    MessageTooLong { msg_len: u32, max: usize },
}

/// Violations of the handshake message rules.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Two fragments of one sequence number disagree on type or length
    #[error(
        "fragment mismatch for seq {seq}: expected type {expected_type} length {expected_len}, \
         got type {actual_type} length {actual_len}"
    )]
    FragmentMismatch {
        seq: u16,
        expected_type: u8,
        expected_len: u32,
        actual_type: u8,
        actual_len: u32,
    },

    /// Record type not allowed in the current state
    #[error("unexpected record of content type {content_type}")]
    UnexpectedRecord { content_type: u8 },

    /// Handshake message that is not the next one expected in the encrypted epoch
    #[error("unexpected handshake message seq {seq} in epoch {epoch}, expected seq {expected}")]
    UnexpectedMessage { seq: u16, epoch: u16, expected: u16 },

    /// ChangeCipherSpec arrived under encryption
    #[error("encrypted ChangeCipherSpec")]
    EncryptedChangeCipherSpec,

    /// ChangeCipherSpec payload other than the single byte 0x01
    #[error("malformed ChangeCipherSpec of {len} bytes")]
    BadChangeCipherSpec { len: usize },
}

/// Size limits and allocation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    /// Bitmap size computation overflowed
    #[error("bitmap of {bits} bits overflows")]
    Overflow { bits: usize },

    /// Allocator refused a buffer
    #[error("failed to allocate {bytes} bytes")]
    AllocationFailed { bytes: usize },

    /// Outgoing flight already holds the maximum number of messages
    #[error("outgoing flight full: max {max} messages")]
    FlightFull { max: usize },

    /// Outgoing body does not fit the 24-bit length field
    #[error("message body of {len} bytes exceeds 24-bit length field")]
    MessageTooLong { len: usize },

    /// Caller-provided output buffer cannot hold the record
    #[error("output buffer too small: need {required} bytes, got {actual}")]
    BufferTooSmall { required: usize, actual: usize },
}

/// TLS alert descriptions surfaced by [`Error::alert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertDescription {
    UnexpectedMessage = 10,
    IllegalParameter = 47,
    DecodeError = 50,
    InternalError = 80,
}

impl Error {
    /// Alert the caller should send for this error, if any.
    ///
    /// Timeouts and transport errors return `None`: the peer is unreachable
    /// and an alert would not arrive.
    pub fn alert(&self) -> Option<AlertDescription> {
        match self {
            Error::Decode(_) => Some(AlertDescription::DecodeError),
            Error::Protocol(ProtocolError::FragmentMismatch { .. })
            | Error::Protocol(ProtocolError::BadChangeCipherSpec { .. }) => {
                Some(AlertDescription::IllegalParameter)
            }
            Error::Protocol(_) => Some(AlertDescription::UnexpectedMessage),
            Error::Resource(_) | Error::Internal(_) | Error::MtuTooSmall { .. } => {
                Some(AlertDescription::InternalError)
            }
            Error::Config(_) => Some(AlertDescription::InternalError),
            Error::TimedOut { .. } | Error::Io(_) => None,
        }
    }
}

/// Type alias for Result with our Error type
pub type Result<T> = std::result::Result<T, Error>;
