//! Outgoing flight: buffering, MTU packing and retransmission.
//!
//! A flight is the group of messages one side sends before waiting for the
//! peer. Messages are kept fully encoded until the flight is replaced, so the
//! whole flight can be re-packed and resent from the start on every timeout.
//!
//! # Packing
//!
//! Packets are filled greedily with records; records are filled greedily
//! with handshake fragments of one epoch:
//!
//! - A ChangeCipherSpec is always a record of its own
//! - An epoch change starts a new record in the same packet
//! - A fragment needs room for its 12-byte header plus at least one body
//!   byte; a partially sent message ends the packet
//!
//! # Cursor
//!
//! `(written, offset)` names the next message and body offset to send. It is
//! saved before each packet and restored if the transport would block, so a
//! resumed send re-packs exactly the packet that did not go out.

use crate::error::{Error, ResourceError, Result};
use crate::fragment::{FragmentHeader, HEADER_LEN};
use crate::record::{ContentType, RecordLayer, CHANGE_CIPHER_SPEC_PAYLOAD};
use crate::transport::DatagramTransport;
use log::{debug, trace};
use std::collections::BTreeMap;
use std::io;

/// What an outgoing message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutgoingKind {
    Handshake(FragmentHeader),
    ChangeCipherSpec,
}

/// A message queued in the current flight.
#[derive(Debug, Clone)]
struct OutgoingMessage {
    /// Encoded header and body; empty for ChangeCipherSpec
    data: Vec<u8>,

    /// Write epoch in effect when the message was queued
    epoch: u16,

    kind: OutgoingKind,
}

/// Whether to keep sealing records into the current packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealStatus {
    Continue,
    Flush,
}

/// Outcome of sending a flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightStatus {
    /// Every packet of the flight went out
    Sent,
    /// The transport would block; resume later
    WouldBlock,
}

/// Counts from one call to [`Flight::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSummary {
    pub status: FlightStatus,
    pub packets: usize,
    pub bytes: usize,
}

/// The current outgoing flight and its transmission cursor.
#[derive(Debug)]
pub struct Flight {
    messages: Vec<OutgoingMessage>,

    /// Index of the next message to send
    written: usize,

    /// Body bytes of `messages[written]` already sent
    offset: usize,

    /// No more messages will be added; the timer is running
    closed: bool,

    max_messages: usize,

    /// Queued messages per write epoch
    epoch_refs: BTreeMap<u16, usize>,

    /// Reused record payload buffer
    staging: Vec<u8>,
}

impl Flight {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::with_capacity(max_messages),
            written: 0,
            offset: 0,
            closed: false,
            max_messages,
            epoch_refs: BTreeMap::new(),
            staging: Vec::new(),
        }
    }

    /// Queue a message for the flight under `epoch`.
    ///
    /// Queuing into a closed flight first discards it: the peer has moved on,
    /// so the old flight will never be retransmitted again.
    ///
    /// # Returns
    /// `true` if a previous closed flight was discarded; the caller should
    /// stop its retransmission timer.
    ///
    /// # Errors
    /// - `ResourceError::FlightFull` if the flight already holds `max_messages`
    /// - `Error::Internal` if a handshake message is not one whole fragment
    pub fn enqueue(&mut self, data: Vec<u8>, epoch: u16, is_ccs: bool) -> Result<bool> {
        let (data, kind) = if is_ccs {
            (Vec::new(), OutgoingKind::ChangeCipherSpec)
        } else {
            let (header, _, rest) = FragmentHeader::parse(&data)
                .map_err(|_| Error::Internal("outgoing handshake message is malformed"))?;
            if !header.is_whole_message() || !rest.is_empty() {
                return Err(Error::Internal(
                    "outgoing handshake message is not a single whole fragment",
                ));
            }
            (data, OutgoingKind::Handshake(header))
        };

        let started_new = self.closed;
        if started_new {
            debug!(
                "discarding previous flight of {} messages",
                self.messages.len()
            );
            self.clear();
        }

        if self.messages.len() >= self.max_messages {
            return Err(ResourceError::FlightFull {
                max: self.max_messages,
            }
            .into());
        }

        *self.epoch_refs.entry(epoch).or_insert(0) += 1;
        self.messages.push(OutgoingMessage { data, epoch, kind });
        Ok(started_new)
    }

    /// Bytes of the most recently queued message (empty for ChangeCipherSpec).
    pub fn last_message(&self) -> Option<&[u8]> {
        self.messages.last().map(|message| message.data.as_slice())
    }

    /// Close the flight. Returns false if it was already closed or is empty.
    pub fn close(&mut self) -> bool {
        if self.closed || self.messages.is_empty() {
            return false;
        }
        self.closed = true;
        true
    }

    /// Drop every message and reopen the flight with the cursor at the start.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.epoch_refs.clear();
        self.written = 0;
        self.offset = 0;
        self.closed = false;
    }

    /// Move the cursor back to the first byte of the first message.
    pub fn rewind(&mut self) {
        self.written = 0;
        self.offset = 0;
    }

    /// Seal the next record of the flight into `out`.
    ///
    /// # Returns
    /// `(status, bytes written)`. `Flush` with zero bytes means nothing more
    /// fits in `out` or the flight is fully written.
    pub fn seal_next_record<R: RecordLayer>(
        &mut self,
        record_layer: &mut R,
        out: &mut [u8],
    ) -> Result<(SealStatus, usize)> {
        let Some(first) = self.messages.get(self.written) else {
            return Ok((SealStatus::Flush, 0));
        };
        let epoch = first.epoch;

        if out.len() <= record_layer.prefix_len(epoch) {
            return Ok((SealStatus::Flush, 0));
        }
        let max_in = record_layer.max_plaintext_len(epoch, out.len());
        if max_in == 0 {
            return Ok((SealStatus::Flush, 0));
        }

        if first.kind == OutgoingKind::ChangeCipherSpec {
            let len = record_layer.seal(
                ContentType::ChangeCipherSpec,
                &CHANGE_CIPHER_SPEC_PAYLOAD,
                epoch,
                out,
            )?;
            self.written += 1;
            self.offset = 0;
            return Ok((SealStatus::Continue, len));
        }

        self.staging.clear();
        let mut should_continue = false;
        while let Some(message) = self.messages.get(self.written) {
            let header = match message.kind {
                OutgoingKind::Handshake(header) if message.epoch == epoch => header,
                _ => {
                    should_continue = true;
                    break;
                }
            };

            let capacity = max_in - self.staging.len();
            if capacity < HEADER_LEN + 1 {
                break;
            }

            let body = &message.data[HEADER_LEN..];
            let remaining = body.len() - self.offset;
            let todo = remaining.min(capacity - HEADER_LEN);

            FragmentHeader {
                frag_off: self.offset as u32,
                frag_len: todo as u32,
                ..header
            }
            .encode(&mut self.staging);
            self.staging
                .extend_from_slice(&body[self.offset..self.offset + todo]);
            trace!(
                "fragment seq {} [{}, +{}) of {}",
                header.seq,
                self.offset,
                todo,
                header.msg_len
            );

            if todo < remaining {
                self.offset += todo;
                break;
            }
            self.offset = 0;
            self.written += 1;
        }

        if self.staging.is_empty() {
            return Ok((SealStatus::Flush, 0));
        }

        let len = record_layer.seal(ContentType::Handshake, &self.staging, epoch, out)?;
        let status = if should_continue {
            SealStatus::Continue
        } else {
            SealStatus::Flush
        };
        Ok((status, len))
    }

    /// Fill `out` with as many records as fit. Returns the packet length.
    pub fn pack_next_packet<R: RecordLayer>(
        &mut self,
        record_layer: &mut R,
        out: &mut [u8],
    ) -> Result<usize> {
        let mut total = 0;
        loop {
            let (status, len) = self.seal_next_record(record_layer, &mut out[total..])?;
            total += len;
            if status == SealStatus::Flush {
                return Ok(total);
            }
        }
    }

    /// Send the unsent remainder of the flight in packets of at most `mtu` bytes.
    ///
    /// # Errors
    /// - `Error::MtuTooSmall` if no progress fits in an empty packet
    /// - `Error::Io` for transport errors other than would-block
    pub fn send<R: RecordLayer, W: DatagramTransport>(
        &mut self,
        record_layer: &mut R,
        transport: &mut W,
        mtu: usize,
    ) -> Result<SendSummary> {
        let mut summary = SendSummary {
            status: FlightStatus::Sent,
            packets: 0,
            bytes: 0,
        };
        let mut packet = vec![0u8; mtu];

        while !self.is_fully_written() {
            let saved = (self.written, self.offset);
            let len = self.pack_next_packet(record_layer, &mut packet)?;
            if len == 0 {
                return Err(Error::MtuTooSmall { mtu });
            }

            match transport.send(&packet[..len]) {
                Ok(n) if n > 0 => {
                    summary.packets += 1;
                    summary.bytes += len;
                }
                Ok(_) => {
                    (self.written, self.offset) = saved;
                    summary.status = FlightStatus::WouldBlock;
                    return Ok(summary);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    (self.written, self.offset) = saved;
                    summary.status = FlightStatus::WouldBlock;
                    return Ok(summary);
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(summary)
    }

    /// True if `epoch` is still needed by a queued message.
    pub fn references_epoch(&self, epoch: u16) -> bool {
        self.epoch_refs.get(&epoch).is_some_and(|&count| count > 0)
    }

    pub fn is_fully_written(&self) -> bool {
        self.written >= self.messages.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current `(message index, body offset)` cursor.
    pub fn cursor(&self) -> (usize, usize) {
        (self.written, self.offset)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
