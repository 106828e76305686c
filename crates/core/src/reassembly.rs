//! Handshake message reassembly with bounded memory.
//!
//! The reassembler keeps a fixed window of message slots starting at the next
//! expected sequence number. Fragments for any message in the window are
//! copied into place as they arrive; messages are handed out strictly in
//! sequence order once complete.
//!
//! # Design
//!
//! - **Bounded window**: `W` slots, message `seq` lives in slot `seq % W`
//! - **Lazy allocation**: a slot's buffer is created on its first fragment
//! - **Contiguous buffer**: header + body in one allocation, so a complete
//!   message can be fed to the transcript in one piece
//! - **Silent drops**: fragments from the past or beyond the window are
//!   discarded; the peer's retransmission recovers them
//!
//! # Memory Bounds
//!
//! Maximum buffering:
//! ```text
//! W * (HEADER_LEN + max_message_len) + bitmap overhead
//! ```
//!
//! With the defaults (7 slots, 100 KiB messages) that is roughly 700 KiB.
//!
//! # Thread Safety
//!
//! This structure is NOT thread-safe. One reassembler per connection.

use crate::bitmap::MessageBitmap;
use crate::error::{Error, ProtocolError, ResourceError, Result};
use crate::fragment::{FragmentHeader, HEADER_LEN};
use log::{debug, trace};

/// State for a single message being reassembled.
#[derive(Debug)]
struct IncomingMessage {
    msg_type: u8,
    seq: u16,
    msg_len: u32,

    /// Synthesized whole-message header followed by the body
    data: Vec<u8>,

    /// Body bytes received so far
    received: MessageBitmap,
}

impl IncomingMessage {
    /// Allocate state when the first fragment of a message arrives.
    fn new(header: &FragmentHeader) -> Result<Self> {
        let total = HEADER_LEN + header.msg_len as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(total)
            .map_err(|_| ResourceError::AllocationFailed { bytes: total })?;

        FragmentHeader::for_message(header.msg_type, header.seq, header.msg_len).encode(&mut data);
        data.resize(total, 0);

        Ok(Self {
            msg_type: header.msg_type,
            seq: header.seq,
            msg_len: header.msg_len,
            data,
            received: MessageBitmap::new(header.msg_len as usize)?,
        })
    }

    /// Copy a fragment into place. Returns true if the message is now complete.
    fn insert_fragment(&mut self, frag_off: usize, body: &[u8]) -> bool {
        let start = HEADER_LEN + frag_off;
        self.data[start..start + body.len()].copy_from_slice(body);
        self.received.mark_range(frag_off, frag_off + body.len());
        self.received.is_complete()
    }

    fn is_complete(&self) -> bool {
        self.received.is_complete()
    }
}

/// A complete message ready for the handshake state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    pub msg_type: u8,
    pub seq: u16,

    /// Message body
    pub body: &'a [u8],

    /// Whole-message header followed by the body, as hashed into the transcript
    pub raw: &'a [u8],
}

/// What happened to a fragment handed to the reassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentDisposition {
    /// Stored; the message is still incomplete
    Buffered,
    /// Stored and the message is now complete
    Completed,
    /// Message already complete; fragment ignored
    Duplicate,
    /// Message already consumed; fragment dropped
    Stale,
    /// Message too far ahead of the window; fragment dropped
    BeyondWindow,
}

/// Reassembler for incoming handshake messages.
///
/// Maintains a fixed window of slots keyed by sequence number.
pub struct Reassembler {
    /// Slot `i` holds the message whose `seq % slots.len() == i`
    slots: Vec<Option<IncomingMessage>>,

    /// Next sequence number to hand out
    read_seq: u16,

    /// Largest declared message length accepted
    max_message_len: usize,
}

impl Reassembler {
    /// Create a new reassembler.
    ///
    /// # Arguments
    /// - `window`: number of message slots (must be positive)
    /// - `max_message_len`: largest `msg_len` accepted from the peer
    pub fn new(window: usize, max_message_len: usize) -> Self {
        let mut slots = Vec::with_capacity(window);
        slots.resize_with(window, || None);
        Self {
            slots,
            read_seq: 0,
            max_message_len,
        }
    }

    /// Process one inbound fragment.
    ///
    /// # Errors
    /// - Decode errors if the fragment range or message length is invalid
    /// - `ProtocolError::FragmentMismatch` if the slot holds a message with a
    ///   different type or length
    /// - Resource errors if the message buffer cannot be allocated
    pub fn process_fragment(
        &mut self,
        header: &FragmentHeader,
        body: &[u8],
    ) -> Result<FragmentDisposition> {
        header.validate(self.max_message_len)?;
        if body.len() != header.frag_len as usize {
            return Err(Error::Internal("fragment body does not match its header"));
        }

        if header.seq < self.read_seq {
            trace!("dropping fragment of consumed message seq {}", header.seq);
            return Ok(FragmentDisposition::Stale);
        }

        let window = self.slots.len();
        if (header.seq - self.read_seq) as usize >= window {
            debug!(
                "dropping fragment seq {}: beyond window [{}, {})",
                header.seq,
                self.read_seq,
                self.read_seq as usize + window
            );
            return Ok(FragmentDisposition::BeyondWindow);
        }

        let index = header.seq as usize % window;
        let created = self.slots[index].is_none();
        if created {
            trace!(
                "new message seq {} type {} length {}",
                header.seq,
                header.msg_type,
                header.msg_len
            );
            self.slots[index] = Some(IncomingMessage::new(header)?);
        }
        let Some(message) = self.slots[index].as_mut() else {
            return Err(Error::Internal("reassembly slot missing after insert"));
        };

        if message.msg_type != header.msg_type || message.msg_len != header.msg_len {
            return Err(ProtocolError::FragmentMismatch {
                seq: header.seq,
                expected_type: message.msg_type,
                expected_len: message.msg_len,
                actual_type: header.msg_type,
                actual_len: header.msg_len,
            }
            .into());
        }

        // An empty message is complete as soon as its slot exists.
        if message.is_complete() {
            return Ok(if created {
                FragmentDisposition::Completed
            } else {
                FragmentDisposition::Duplicate
            });
        }

        if message.insert_fragment(header.frag_off as usize, body) {
            debug!("message seq {} complete ({} bytes)", message.seq, message.msg_len);
            Ok(FragmentDisposition::Completed)
        } else {
            Ok(FragmentDisposition::Buffered)
        }
    }

    /// The next message in sequence, if it has fully arrived.
    pub fn current_message(&self) -> Option<Message<'_>> {
        let message = self.slots[self.current_index()].as_ref()?;
        if !message.is_complete() {
            return None;
        }
        Some(Message {
            msg_type: message.msg_type,
            seq: message.seq,
            body: &message.data[HEADER_LEN..],
            raw: &message.data,
        })
    }

    /// Release the current message and move to the next sequence number.
    ///
    /// Returns false without changing anything if the current message is not
    /// complete.
    pub fn advance(&mut self) -> bool {
        let index = self.current_index();
        match &self.slots[index] {
            Some(message) if message.is_complete() => {
                self.slots[index] = None;
                self.read_seq = self.read_seq.wrapping_add(1);
                true
            }
            _ => false,
        }
    }

    /// True if any slot besides a complete current message holds data.
    pub fn has_pending_data(&self) -> bool {
        let current = self.current_index();
        self.slots.iter().enumerate().any(|(index, slot)| match slot {
            Some(message) => index != current || !message.is_complete(),
            None => false,
        })
    }

    /// Next sequence number to be handed out.
    pub fn read_seq(&self) -> u16 {
        self.read_seq
    }

    /// Get statistics about current reassembly state.
    pub fn stats(&self) -> ReassemblerStats {
        ReassemblerStats {
            buffered_messages: self.slots.iter().filter(|slot| slot.is_some()).count(),
            read_seq: self.read_seq,
        }
    }

    fn current_index(&self) -> usize {
        self.read_seq as usize % self.slots.len()
    }
}

/// Statistics about reassembler state.
#[derive(Debug, Clone, Copy)]
pub struct ReassemblerStats {
    /// Number of slots currently holding a message
    pub buffered_messages: usize,

    /// Next sequence number expected
    pub read_seq: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::fragment::{encode_message, split_message};

    fn fragment(msg_type: u8, seq: u16, msg_len: u32, frag_off: u32, body: &[u8]) -> FragmentHeader {
        FragmentHeader {
            msg_type,
            msg_len,
            seq,
            frag_off,
            frag_len: body.len() as u32,
        }
    }

    fn feed(reassembler: &mut Reassembler, bytes: &[u8]) -> FragmentDisposition {
        let (header, body, _) = FragmentHeader::parse(bytes).unwrap();
        reassembler.process_fragment(&header, body).unwrap()
    }

    #[test]
    fn test_single_message_in_order() {
        let mut reassembler = Reassembler::new(7, 16384);
        let message = encode_message(1, 0, b"client hello").unwrap();

        assert_eq!(feed(&mut reassembler, &message), FragmentDisposition::Completed);

        let current = reassembler.current_message().unwrap();
        assert_eq!(current.msg_type, 1);
        assert_eq!(current.body, b"client hello");
        assert_eq!(current.raw, &message[..]);
    }

    #[test]
    fn test_out_of_order_fragments() {
        let mut reassembler = Reassembler::new(7, 16384);
        let body: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let message = encode_message(11, 0, &body).unwrap();
        let mut fragments = split_message(&message, 700).unwrap();
        fragments.reverse();

        let last = fragments.pop().unwrap();
        for fragment in &fragments {
            assert_eq!(feed(&mut reassembler, fragment), FragmentDisposition::Buffered);
            assert!(reassembler.current_message().is_none());
        }
        assert_eq!(feed(&mut reassembler, &last), FragmentDisposition::Completed);
        assert_eq!(reassembler.current_message().unwrap().body, &body[..]);
    }

    #[test]
    fn test_overlapping_fragments() {
        let mut reassembler = Reassembler::new(7, 16384);
        let body = b"0123456789";

        let header = fragment(2, 0, 10, 0, &body[..6]);
        reassembler.process_fragment(&header, &body[..6]).unwrap();
        let header = fragment(2, 0, 10, 4, &body[4..]);
        let disposition = reassembler.process_fragment(&header, &body[4..]).unwrap();

        assert_eq!(disposition, FragmentDisposition::Completed);
        assert_eq!(reassembler.current_message().unwrap().body, body);
    }

    #[test]
    fn test_duplicate_after_completion() {
        let mut reassembler = Reassembler::new(7, 16384);
        let message = encode_message(2, 0, b"server hello").unwrap();

        feed(&mut reassembler, &message);
        assert_eq!(feed(&mut reassembler, &message), FragmentDisposition::Duplicate);
        assert_eq!(reassembler.current_message().unwrap().body, b"server hello");
    }

    #[test]
    fn test_empty_message_completes_immediately() {
        let mut reassembler = Reassembler::new(7, 16384);
        let message = encode_message(14, 0, b"").unwrap();

        assert_eq!(feed(&mut reassembler, &message), FragmentDisposition::Completed);
        assert!(reassembler.current_message().unwrap().body.is_empty());
    }

    #[test]
    fn test_empty_message_repeat_is_duplicate() {
        let mut reassembler = Reassembler::new(7, 16384);
        let message = encode_message(14, 0, b"").unwrap();

        assert_eq!(feed(&mut reassembler, &message), FragmentDisposition::Completed);
        assert_eq!(feed(&mut reassembler, &message), FragmentDisposition::Duplicate);
    }

    #[test]
    fn test_future_message_buffered_until_current() {
        let mut reassembler = Reassembler::new(7, 16384);

        feed(&mut reassembler, &encode_message(12, 1, b"second").unwrap());
        assert!(reassembler.current_message().is_none());
        assert!(reassembler.has_pending_data());

        feed(&mut reassembler, &encode_message(11, 0, b"first").unwrap());
        assert_eq!(reassembler.current_message().unwrap().body, b"first");

        assert!(reassembler.advance());
        assert_eq!(reassembler.current_message().unwrap().body, b"second");
        assert!(!reassembler.has_pending_data());

        assert!(reassembler.advance());
        assert!(reassembler.current_message().is_none());
        assert_eq!(reassembler.read_seq(), 2);
    }

    #[test]
    fn test_advance_requires_complete_message() {
        let mut reassembler = Reassembler::new(7, 16384);
        assert!(!reassembler.advance());

        let header = fragment(1, 0, 10, 0, b"01234");
        reassembler.process_fragment(&header, b"01234").unwrap();
        assert!(!reassembler.advance());
        assert_eq!(reassembler.read_seq(), 0);
    }

    #[test]
    fn test_beyond_window_dropped_without_slot() {
        let mut reassembler = Reassembler::new(7, 16384);

        let message = encode_message(1, 7, b"too far").unwrap();
        assert_eq!(feed(&mut reassembler, &message), FragmentDisposition::BeyondWindow);
        assert_eq!(reassembler.stats().buffered_messages, 0);

        let message = encode_message(1, 6, b"edge").unwrap();
        assert_eq!(feed(&mut reassembler, &message), FragmentDisposition::Completed);
        assert_eq!(reassembler.stats().buffered_messages, 1);
    }

    #[test]
    fn test_stale_fragment_dropped() {
        let mut reassembler = Reassembler::new(7, 16384);
        let message = encode_message(1, 0, b"hello").unwrap();
        feed(&mut reassembler, &message);
        reassembler.advance();

        assert_eq!(feed(&mut reassembler, &message), FragmentDisposition::Stale);
        assert_eq!(reassembler.stats().buffered_messages, 0);
    }

    #[test]
    fn test_length_mismatch() {
        let mut reassembler = Reassembler::new(7, 16384);

        let header = fragment(11, 1, 100, 0, &[0u8; 50]);
        reassembler.process_fragment(&header, &[0u8; 50]).unwrap();

        let header = fragment(11, 1, 101, 50, &[0u8; 50]);
        let result = reassembler.process_fragment(&header, &[0u8; 50]);
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::FragmentMismatch {
                expected_len: 100,
                actual_len: 101,
                ..
            }))
        ));
    }

    #[test]
    fn test_type_mismatch() {
        let mut reassembler = Reassembler::new(7, 16384);

        let header = fragment(11, 0, 10, 0, &[0u8; 5]);
        reassembler.process_fragment(&header, &[0u8; 5]).unwrap();

        let header = fragment(12, 0, 10, 5, &[0u8; 5]);
        let result = reassembler.process_fragment(&header, &[0u8; 5]);
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::FragmentMismatch { .. }))
        ));
    }

    #[test]
    fn test_out_of_range_fragment() {
        let mut reassembler = Reassembler::new(7, 16384);
        let header = fragment(11, 0, 15, 10, &[0u8; 10]);
        let result = reassembler.process_fragment(&header, &[0u8; 10]);
        assert!(matches!(
            result,
            Err(Error::Decode(DecodeError::FragmentOutOfRange { .. }))
        ));
        assert_eq!(reassembler.stats().buffered_messages, 0);
    }

    #[test]
    fn test_message_too_long() {
        let mut reassembler = Reassembler::new(7, 1000);
        let header = fragment(11, 0, 1001, 0, &[0u8; 10]);
        let result = reassembler.process_fragment(&header, &[0u8; 10]);
        assert!(matches!(
            result,
            Err(Error::Decode(DecodeError::MessageTooLong { .. }))
        ));
    }

    #[test]
    fn test_slots_reused_after_advance() {
        let mut reassembler = Reassembler::new(3, 16384);
        for seq in 0..10u16 {
            let message = encode_message(1, seq, &seq.to_be_bytes()).unwrap();
            assert_eq!(feed(&mut reassembler, &message), FragmentDisposition::Completed);
            assert_eq!(reassembler.current_message().unwrap().seq, seq);
            assert!(reassembler.advance());
        }
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_any_fragment_order_reassembles(
                body in prop::collection::vec(any::<u8>(), 1..2000),
                piece in 1usize..300,
                order in prop::collection::vec(any::<prop::sample::Index>(), 1..40),
            ) {
                let message = encode_message(11, 0, &body).unwrap();
                let mut fragments = split_message(&message, piece).unwrap();

                // Shuffle deterministically from the generated indices.
                for (i, index) in order.iter().enumerate() {
                    let len = fragments.len();
                    fragments.swap(i % len, index.index(len));
                }

                let mut reassembler = Reassembler::new(7, 16384);
                for fragment in &fragments {
                    feed(&mut reassembler, fragment);
                }
                // Duplicates after completion change nothing.
                for fragment in &fragments {
                    prop_assert_eq!(feed(&mut reassembler, fragment), FragmentDisposition::Duplicate);
                }
                prop_assert_eq!(reassembler.current_message().unwrap().body, &body[..]);
            }
        }
    }
}
