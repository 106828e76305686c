//! Record-layer seam and a plaintext reference implementation.
//!
//! The handshake layer never touches keys. It hands payloads to a
//! [`RecordLayer`] to seal under an epoch and receives opened records back
//! with their content type, epoch and whether they were protected.
//!
//! # Record Format
//!
//! [`PlaintextRecordLayer`] writes standard DTLS 1.2 record headers:
//!
//! ```text
//! +-------------------+
//! | content_type (1)  |  20 CCS, 21 alert, 22 handshake, 23 application data
//! +-------------------+
//! | version (2)       |  0xfefd
//! +-------------------+
//! | epoch (2)         |  u16
//! +-------------------+
//! | seq (6)           |  u48 per-epoch record sequence number
//! +-------------------+
//! | length (2)        |  u16 bytes that follow
//! +-------------------+
//! | [nonce (8)]       |  epochs > 0 only
//! | payload           |
//! | [tag (16)]        |  epochs > 0 only, all zero
//! +-------------------+
//! ```
//!
//! Epochs above zero carry AEAD-sized overhead so MTU arithmetic matches a
//! real cipher, but the payload is not encrypted.

use crate::error::{Error, ResourceError, Result};
use log::trace;
use std::collections::{BTreeMap, BTreeSet};

/// Size of a DTLS record header in bytes
pub const RECORD_HEADER_LEN: usize = 13;

/// Wire version for DTLS 1.2 records
pub const DTLS12_VERSION: u16 = 0xfefd;

/// Wire version for DTLS 1.0 records, accepted on open
pub const DTLS10_VERSION: u16 = 0xfeff;

/// Explicit nonce carried by protected records
pub const EXPLICIT_NONCE_LEN: usize = 8;

/// Authentication tag carried by protected records
pub const TAG_LEN: usize = 16;

/// Largest plaintext a single record may carry
pub const MAX_PLAINTEXT_LEN: usize = 16384;

/// The only valid ChangeCipherSpec payload
pub const CHANGE_CIPHER_SPEC_PAYLOAD: [u8; 1] = [1];

/// Record content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Unknown(u8),
}

impl From<u8> for ContentType {
    fn from(value: u8) -> Self {
        match value {
            20 => ContentType::ChangeCipherSpec,
            21 => ContentType::Alert,
            22 => ContentType::Handshake,
            23 => ContentType::ApplicationData,
            other => ContentType::Unknown(other),
        }
    }
}

impl From<ContentType> for u8 {
    fn from(value: ContentType) -> Self {
        match value {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
            ContentType::Unknown(other) => other,
        }
    }
}

/// A record the record layer accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedRecord {
    pub content_type: ContentType,
    pub epoch: u16,

    /// Whether the record was protected under a non-null cipher
    pub encrypted: bool,

    /// Decrypted payload
    pub payload: Vec<u8>,

    /// Bytes of the datagram this record occupied
    pub consumed: usize,
}

/// Result of opening the next record in a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opened {
    Record(OpenedRecord),
    /// Record silently dropped (wrong epoch, bad tag, truncated)
    Discard { consumed: usize },
}

impl Opened {
    /// Bytes of the datagram consumed, whether or not the record was kept.
    pub fn consumed(&self) -> usize {
        match self {
            Opened::Record(record) => record.consumed,
            Opened::Discard { consumed } => *consumed,
        }
    }
}

/// Record protection as seen by the handshake layer.
pub trait RecordLayer {
    /// Open the first record in `input`.
    ///
    /// Records that fail authentication or belong to an unreadable epoch are
    /// reported as [`Opened::Discard`]; `consumed` must be positive whenever
    /// `input` is non-empty.
    fn open(&mut self, input: &[u8]) -> Result<Opened>;

    /// Seal `payload` as one record under `epoch` into `out`.
    ///
    /// Returns the number of bytes written.
    fn seal(
        &mut self,
        content_type: ContentType,
        payload: &[u8],
        epoch: u16,
        out: &mut [u8],
    ) -> Result<usize>;

    /// Largest payload that fits in `available` bytes once sealed under `epoch`.
    fn max_plaintext_len(&self, epoch: u16, available: usize) -> usize;

    /// Bytes a sealed record places before the payload.
    fn prefix_len(&self, epoch: u16) -> usize;

    /// Drop write state for an epoch no queued message refers to.
    fn discard_write_epoch(&mut self, _epoch: u16) {}
}

/// Parsed DTLS record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub version: u16,
    pub epoch: u16,
    pub seq: u64,
    pub len: u16,
}

impl RecordHeader {
    /// Parse a header from the front of `bytes`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RECORD_HEADER_LEN {
            return None;
        }
        let mut seq = [0u8; 8];
        seq[2..].copy_from_slice(&bytes[5..11]);
        Some(Self {
            content_type: ContentType::from(bytes[0]),
            version: u16::from_be_bytes([bytes[1], bytes[2]]),
            epoch: u16::from_be_bytes([bytes[3], bytes[4]]),
            seq: u64::from_be_bytes(seq),
            len: u16::from_be_bytes([bytes[11], bytes[12]]),
        })
    }

    fn write(&self, out: &mut [u8]) {
        out[0] = self.content_type.into();
        out[1..3].copy_from_slice(&self.version.to_be_bytes());
        out[3..5].copy_from_slice(&self.epoch.to_be_bytes());
        out[5..11].copy_from_slice(&self.seq.to_be_bytes()[2..]);
        out[11..13].copy_from_slice(&self.len.to_be_bytes());
    }
}

/// Split a datagram into `(header, record body)` pairs.
///
/// Stops at the first truncated record.
pub fn split_datagram(datagram: &[u8]) -> Vec<(RecordHeader, &[u8])> {
    let mut records = Vec::new();
    let mut rest = datagram;
    while let Some(header) = RecordHeader::parse(rest) {
        let end = RECORD_HEADER_LEN + header.len as usize;
        if rest.len() < end {
            break;
        }
        records.push((header, &rest[RECORD_HEADER_LEN..end]));
        rest = &rest[end..];
    }
    records
}

/// Record layer with DTLS 1.2 framing and no confidentiality.
///
/// One epoch is readable at a time, as in DTLS 1.2. Write state is created
/// lazily per epoch and refused once discarded.
#[derive(Debug, Default)]
pub struct PlaintextRecordLayer {
    read_epoch: u16,
    write_seqs: BTreeMap<u16, u64>,
    discarded: BTreeSet<u16>,
}

impl PlaintextRecordLayer {
    /// Create a record layer reading and writing epoch 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch reads to `epoch`; records from other epochs are discarded.
    pub fn set_read_epoch(&mut self, epoch: u16) {
        self.read_epoch = epoch;
    }

    pub fn read_epoch(&self) -> u16 {
        self.read_epoch
    }

    /// True once `epoch` has been discarded for writing.
    pub fn is_write_epoch_discarded(&self, epoch: u16) -> bool {
        self.discarded.contains(&epoch)
    }

    fn overhead(epoch: u16) -> usize {
        if epoch == 0 {
            0
        } else {
            EXPLICIT_NONCE_LEN + TAG_LEN
        }
    }
}

impl RecordLayer for PlaintextRecordLayer {
    fn open(&mut self, input: &[u8]) -> Result<Opened> {
        let Some(header) = RecordHeader::parse(input) else {
            return Ok(Opened::Discard {
                consumed: input.len(),
            });
        };

        let consumed = RECORD_HEADER_LEN + header.len as usize;
        if input.len() < consumed {
            trace!("discarding truncated record ({} of {} bytes)", input.len(), consumed);
            return Ok(Opened::Discard {
                consumed: input.len(),
            });
        }

        if header.version != DTLS12_VERSION && header.version != DTLS10_VERSION {
            return Ok(Opened::Discard { consumed });
        }
        if header.epoch != self.read_epoch {
            trace!(
                "discarding record from epoch {} while reading epoch {}",
                header.epoch,
                self.read_epoch
            );
            return Ok(Opened::Discard { consumed });
        }

        let body = &input[RECORD_HEADER_LEN..consumed];
        let encrypted = header.epoch != 0;
        let payload = if encrypted {
            if body.len() < EXPLICIT_NONCE_LEN + TAG_LEN {
                return Ok(Opened::Discard { consumed });
            }
            let (sealed, tag) = body.split_at(body.len() - TAG_LEN);
            if tag.iter().any(|&b| b != 0) {
                return Ok(Opened::Discard { consumed });
            }
            &sealed[EXPLICIT_NONCE_LEN..]
        } else {
            body
        };

        Ok(Opened::Record(OpenedRecord {
            content_type: header.content_type,
            epoch: header.epoch,
            encrypted,
            payload: payload.to_vec(),
            consumed,
        }))
    }

    fn seal(
        &mut self,
        content_type: ContentType,
        payload: &[u8],
        epoch: u16,
        out: &mut [u8],
    ) -> Result<usize> {
        if self.discarded.contains(&epoch) {
            return Err(Error::Internal("sealing under a discarded write epoch"));
        }

        let overhead = Self::overhead(epoch);
        let body_len = overhead + payload.len();
        let len = u16::try_from(body_len)
            .map_err(|_| ResourceError::MessageTooLong { len: payload.len() })?;
        let total = RECORD_HEADER_LEN + body_len;
        if out.len() < total {
            return Err(ResourceError::BufferTooSmall {
                required: total,
                actual: out.len(),
            }
            .into());
        }

        let next = self.write_seqs.entry(epoch).or_insert(0);
        let seq = *next;
        *next += 1;

        RecordHeader {
            content_type,
            version: DTLS12_VERSION,
            epoch,
            seq,
            len,
        }
        .write(&mut out[..RECORD_HEADER_LEN]);

        let mut pos = RECORD_HEADER_LEN;
        if overhead > 0 {
            out[pos..pos + EXPLICIT_NONCE_LEN].copy_from_slice(&seq.to_be_bytes());
            pos += EXPLICIT_NONCE_LEN;
        }
        out[pos..pos + payload.len()].copy_from_slice(payload);
        pos += payload.len();
        if overhead > 0 {
            out[pos..pos + TAG_LEN].fill(0);
            pos += TAG_LEN;
        }

        trace!(
            "sealed {:?} record epoch {} seq {} ({} bytes)",
            content_type,
            epoch,
            seq,
            pos
        );
        Ok(pos)
    }

    fn max_plaintext_len(&self, epoch: u16, available: usize) -> usize {
        available
            .saturating_sub(RECORD_HEADER_LEN + Self::overhead(epoch))
            .min(MAX_PLAINTEXT_LEN)
    }

    fn prefix_len(&self, epoch: u16) -> usize {
        if epoch == 0 {
            RECORD_HEADER_LEN
        } else {
            RECORD_HEADER_LEN + EXPLICIT_NONCE_LEN
        }
    }

    fn discard_write_epoch(&mut self, epoch: u16) {
        self.write_seqs.remove(&epoch);
        self.discarded.insert(epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seal(layer: &mut PlaintextRecordLayer, content_type: ContentType, payload: &[u8], epoch: u16) -> Vec<u8> {
        let mut out = vec![0u8; 256];
        let len = layer.seal(content_type, payload, epoch, &mut out).unwrap();
        out.truncate(len);
        out
    }

    #[test]
    fn test_content_type_codes() {
        assert_eq!(ContentType::from(22), ContentType::Handshake);
        assert_eq!(u8::from(ContentType::ChangeCipherSpec), 20);
        assert_eq!(ContentType::from(99), ContentType::Unknown(99));
        assert_eq!(u8::from(ContentType::Unknown(99)), 99);
    }

    #[test]
    fn test_seal_open_epoch_zero() {
        let mut layer = PlaintextRecordLayer::new();
        let record = seal(&mut layer, ContentType::Handshake, b"fragment", 0);
        assert_eq!(record.len(), RECORD_HEADER_LEN + 8);

        let opened = layer.open(&record).unwrap();
        let Opened::Record(opened) = opened else {
            panic!("record discarded");
        };
        assert_eq!(opened.content_type, ContentType::Handshake);
        assert!(!opened.encrypted);
        assert_eq!(opened.payload, b"fragment");
        assert_eq!(opened.consumed, record.len());
    }

    #[test]
    fn test_protected_epoch_overhead() {
        let mut layer = PlaintextRecordLayer::new();
        let record = seal(&mut layer, ContentType::Handshake, b"finished", 1);
        assert_eq!(record.len(), RECORD_HEADER_LEN + EXPLICIT_NONCE_LEN + 8 + TAG_LEN);
        assert_eq!(layer.max_plaintext_len(1, 100), 100 - 13 - 24);
        assert_eq!(layer.prefix_len(1), 21);

        // Not readable until the read epoch advances.
        assert_eq!(layer.open(&record).unwrap(), Opened::Discard { consumed: record.len() });

        layer.set_read_epoch(1);
        let Opened::Record(opened) = layer.open(&record).unwrap() else {
            panic!("record discarded");
        };
        assert!(opened.encrypted);
        assert_eq!(opened.payload, b"finished");
    }

    #[test]
    fn test_bad_tag_discarded() {
        let mut layer = PlaintextRecordLayer::new();
        let mut record = seal(&mut layer, ContentType::Handshake, b"data", 2);
        let last = record.len() - 1;
        record[last] ^= 1;

        layer.set_read_epoch(2);
        assert!(matches!(layer.open(&record).unwrap(), Opened::Discard { .. }));
    }

    #[test]
    fn test_truncated_record_consumes_rest() {
        let mut layer = PlaintextRecordLayer::new();
        let record = seal(&mut layer, ContentType::Handshake, b"payload", 0);
        let truncated = &record[..record.len() - 2];
        assert_eq!(
            layer.open(truncated).unwrap(),
            Opened::Discard {
                consumed: truncated.len()
            }
        );
    }

    #[test]
    fn test_record_sequence_numbers_per_epoch() {
        let mut layer = PlaintextRecordLayer::new();
        let mut datagram = seal(&mut layer, ContentType::Handshake, b"a", 0);
        datagram.extend(seal(&mut layer, ContentType::ChangeCipherSpec, &[1], 0));
        datagram.extend(seal(&mut layer, ContentType::Handshake, b"b", 1));

        let records = split_datagram(&datagram);
        let seqs: Vec<(u16, u64)> = records.iter().map(|(h, _)| (h.epoch, h.seq)).collect();
        assert_eq!(seqs, vec![(0, 0), (0, 1), (1, 0)]);
        assert_eq!(records[1].0.content_type, ContentType::ChangeCipherSpec);
    }

    #[test]
    fn test_discarded_epoch_refuses_seal() {
        let mut layer = PlaintextRecordLayer::new();
        layer.discard_write_epoch(0);
        assert!(layer.is_write_epoch_discarded(0));

        let mut out = [0u8; 64];
        let result = layer.seal(ContentType::Handshake, b"x", 0, &mut out);
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[test]
    fn test_seal_buffer_too_small() {
        let mut layer = PlaintextRecordLayer::new();
        let mut out = [0u8; 16];
        let result = layer.seal(ContentType::Handshake, b"too long", 0, &mut out);
        assert!(matches!(
            result,
            Err(Error::Resource(ResourceError::BufferTooSmall { required: 21, .. }))
        ));
    }
}
