//! Handshake fragment wire format.
//!
//! Every handshake message travels as one or more fragments. Each fragment
//! carries the full message's type, length and sequence number plus the byte
//! range of the body it covers.
//!
//! # Fragment Format
//!
//! ```text
//! +-------------------+
//! | msg_type (1)      |  handshake message type
//! +-------------------+
//! | msg_len (3)       |  u24 total body length of the message
//! +-------------------+
//! | seq (2)           |  u16 handshake message sequence number
//! +-------------------+
//! | frag_off (3)      |  u24 offset of this fragment in the body
//! +-------------------+
//! | frag_len (3)      |  u24 bytes of body in this fragment
//! +-------------------+
//! | body              |  frag_len bytes
//! | (variable)        |
//! +-------------------+
//! ```
//!
//! All integers are big-endian. A record may hold several fragments back to
//! back.
//!
//! # Outgoing Messages
//!
//! Outgoing messages are stored fully encoded as a single fragment with
//! `frag_off = 0` and `frag_len = msg_len`; the flight re-fragments them at
//! send time.

use crate::error::{DecodeError, ResourceError, Result};

/// Size of the fragment header in bytes
pub const HEADER_LEN: usize = 12;

/// Largest value a u24 length field can hold
pub const MAX_U24: usize = 0xff_ffff;

/// Handshake message type codes, for logging and the simulator script.
pub mod handshake_type {
    pub const HELLO_REQUEST: u8 = 0;
    pub const CLIENT_HELLO: u8 = 1;
    pub const SERVER_HELLO: u8 = 2;
    pub const HELLO_VERIFY_REQUEST: u8 = 3;
    pub const NEW_SESSION_TICKET: u8 = 4;
    pub const CERTIFICATE: u8 = 11;
    pub const SERVER_KEY_EXCHANGE: u8 = 12;
    pub const CERTIFICATE_REQUEST: u8 = 13;
    pub const SERVER_HELLO_DONE: u8 = 14;
    pub const CERTIFICATE_VERIFY: u8 = 15;
    pub const CLIENT_KEY_EXCHANGE: u8 = 16;
    pub const FINISHED: u8 = 20;

    /// Human-readable name of a message type.
    pub fn name(msg_type: u8) -> &'static str {
        match msg_type {
            HELLO_REQUEST => "HelloRequest",
            CLIENT_HELLO => "ClientHello",
            SERVER_HELLO => "ServerHello",
            HELLO_VERIFY_REQUEST => "HelloVerifyRequest",
            NEW_SESSION_TICKET => "NewSessionTicket",
            CERTIFICATE => "Certificate",
            SERVER_KEY_EXCHANGE => "ServerKeyExchange",
            CERTIFICATE_REQUEST => "CertificateRequest",
            SERVER_HELLO_DONE => "ServerHelloDone",
            CERTIFICATE_VERIFY => "CertificateVerify",
            CLIENT_KEY_EXCHANGE => "ClientKeyExchange",
            FINISHED => "Finished",
            _ => "Unknown",
        }
    }
}

/// Decoded 12-byte fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub msg_type: u8,
    pub msg_len: u32,
    pub seq: u16,
    pub frag_off: u32,
    pub frag_len: u32,
}

fn read_u24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

fn write_u24(out: &mut [u8], value: u32) {
    out.copy_from_slice(&value.to_be_bytes()[1..]);
}

impl FragmentHeader {
    /// Header for a whole message carried in a single fragment.
    pub fn for_message(msg_type: u8, seq: u16, msg_len: u32) -> Self {
        Self {
            msg_type,
            msg_len,
            seq,
            frag_off: 0,
            frag_len: msg_len,
        }
    }

    /// Serialize the header to its 12-byte wire form.
    ///
    /// Length fields are truncated to 24 bits; callers validate lengths
    /// before building headers.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.msg_type;
        write_u24(&mut out[1..4], self.msg_len);
        out[4..6].copy_from_slice(&self.seq.to_be_bytes());
        write_u24(&mut out[6..9], self.frag_off);
        write_u24(&mut out[9..12], self.frag_len);
        out
    }

    /// Append the wire form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_bytes());
    }

    /// Parse one fragment from the front of `bytes`.
    ///
    /// # Returns
    /// `(header, body, rest)` where `body` is exactly `frag_len` bytes and
    /// `rest` is whatever follows the fragment.
    ///
    /// # Errors
    /// - `DecodeError::TruncatedHeader` if fewer than 12 bytes remain
    /// - `DecodeError::TruncatedBody` if the body is shorter than `frag_len`
    pub fn parse(bytes: &[u8]) -> Result<(Self, &[u8], &[u8])> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::TruncatedHeader {
                required: HEADER_LEN,
                actual: bytes.len(),
            }
            .into());
        }

        let header = Self {
            msg_type: bytes[0],
            msg_len: read_u24(&bytes[1..4]),
            seq: u16::from_be_bytes([bytes[4], bytes[5]]),
            frag_off: read_u24(&bytes[6..9]),
            frag_len: read_u24(&bytes[9..12]),
        };

        let rest = &bytes[HEADER_LEN..];
        let frag_len = header.frag_len as usize;
        if rest.len() < frag_len {
            return Err(DecodeError::TruncatedBody {
                expected: frag_len,
                actual: rest.len(),
            }
            .into());
        }

        let (body, rest) = rest.split_at(frag_len);
        Ok((header, body, rest))
    }

    /// Check the fragment range and message length.
    ///
    /// # Errors
    /// - `DecodeError::FragmentOutOfRange` if `frag_off + frag_len > msg_len`
    /// - `DecodeError::MessageTooLong` if `msg_len > max_message_len`
    pub fn validate(&self, max_message_len: usize) -> Result<()> {
        // u24 fields cannot overflow a u32 sum
        if self.frag_off + self.frag_len > self.msg_len {
            return Err(DecodeError::FragmentOutOfRange {
                frag_off: self.frag_off,
                frag_len: self.frag_len,
                msg_len: self.msg_len,
            }
            .into());
        }
        if self.msg_len as usize > max_message_len {
            return Err(DecodeError::MessageTooLong {
                msg_len: self.msg_len,
                max: max_message_len,
            }
            .into());
        }
        Ok(())
    }

    /// Exclusive end of the fragment's body range.
    pub fn frag_end(&self) -> usize {
        self.frag_off as usize + self.frag_len as usize
    }

    /// True if this fragment is the whole message.
    pub fn is_whole_message(&self) -> bool {
        self.frag_off == 0 && self.frag_len == self.msg_len
    }
}

/// Encode a complete handshake message as a single fragment.
///
/// # Errors
/// Returns `ResourceError::MessageTooLong` if `body` exceeds the u24 length field.
pub fn encode_message(msg_type: u8, seq: u16, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_U24 {
        return Err(ResourceError::MessageTooLong { len: body.len() }.into());
    }

    let header = FragmentHeader::for_message(msg_type, seq, body.len() as u32);
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    header.encode(&mut out);
    out.extend_from_slice(body);
    Ok(out)
}

/// Split an encoded whole message into fragments of at most
/// `max_fragment_body` body bytes each.
///
/// An empty message still yields one header-only fragment.
///
/// # Errors
/// - Decode errors if `message` is not a single whole-message fragment
/// - `Error::Config` if `max_fragment_body` is zero
pub fn split_message(message: &[u8], max_fragment_body: usize) -> Result<Vec<Vec<u8>>> {
    if max_fragment_body == 0 {
        return Err(crate::error::Error::Config(
            "fragment body size must be positive".to_string(),
        ));
    }

    let (header, body, _) = FragmentHeader::parse(message)?;
    if !header.is_whole_message() {
        return Err(DecodeError::FragmentOutOfRange {
            frag_off: header.frag_off,
            frag_len: header.frag_len,
            msg_len: header.msg_len,
        }
        .into());
    }

    if body.is_empty() {
        return Ok(vec![message[..HEADER_LEN].to_vec()]);
    }

    let fragments = body
        .chunks(max_fragment_body)
        .enumerate()
        .map(|(i, piece)| {
            let fragment_header = FragmentHeader {
                frag_off: (i * max_fragment_body) as u32,
                frag_len: piece.len() as u32,
                ..header
            };
            let mut out = Vec::with_capacity(HEADER_LEN + piece.len());
            fragment_header.encode(&mut out);
            out.extend_from_slice(piece);
            out
        })
        .collect();

    Ok(fragments)
}
