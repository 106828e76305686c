//! Per-connection handshake message layer.
//!
//! [`Connection`] owns everything one DTLS connection needs to turn datagrams
//! into an ordered stream of handshake messages and back:
//!
//! - the inbound [`Reassembler`] and the outbound [`Flight`]
//! - the record layer, transport and transcript collaborators
//! - the retransmission timer, MTU and write epoch bookkeeping
//!
//! It is synchronous and never blocks. Callers feed datagrams as they arrive,
//! poll [`Connection::handle_timeout`] with the current time, and resume
//! blocked sends with [`Connection::flush`].
//!
//! # ChangeCipherSpec
//!
//! Processing of a datagram stops right after a ChangeCipherSpec record, so
//! the caller can install new read keys before the remaining records (usually
//! under the next epoch) are opened. [`Feed::consumed`] says where to resume.

use crate::config::{HandshakeConfig, ProtocolVersion, MIN_MTU};
use crate::error::{Error, ProtocolError, Result};
use crate::flight::{Flight, FlightStatus};
use crate::fragment::{encode_message, handshake_type, FragmentHeader};
use crate::metrics::{Metrics, ReorderTracker};
use crate::reassembly::{FragmentDisposition, Message, Reassembler};
use crate::record::{ContentType, Opened, OpenedRecord, RecordLayer, CHANGE_CIPHER_SPEC_PAYLOAD};
use crate::timer::{RetransmitTimer, MTU_FALLBACK_TIMEOUTS};
use crate::transport::{DatagramTransport, Transcript};
use log::{debug, trace, warn};
use std::collections::BTreeSet;
use std::time::Instant;

/// Whether a datagram contributed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// At least one record carried new handshake data or a ChangeCipherSpec
    Accepted,
    /// Everything was dropped or ignored
    Discarded,
}

/// Outcome of [`Connection::feed_datagram`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feed {
    pub status: FeedStatus,

    /// Bytes processed; less than the datagram length after a ChangeCipherSpec
    pub consumed: usize,
}

/// Handshake message layer for one connection.
pub struct Connection<R, W, H> {
    config: HandshakeConfig,
    record_layer: R,
    transport: W,
    transcript: H,

    incoming: Reassembler,
    flight: Flight,
    timer: RetransmitTimer,
    mtu: usize,

    handshake_write_seq: u16,
    write_epoch: u16,

    /// Write epochs the record layer still holds state for
    write_epochs: BTreeSet<u16>,

    has_change_cipher_spec: bool,
    handshake_complete: bool,

    metrics: Metrics,
    reorder: ReorderTracker,
}

impl<R: RecordLayer, W: DatagramTransport, H: Transcript> Connection<R, W, H> {
    /// Create a connection writing epoch 0.
    ///
    /// # Errors
    /// Returns `Error::Config` if `config` fails validation.
    pub fn new(config: HandshakeConfig, record_layer: R, transport: W, transcript: H) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            incoming: Reassembler::new(config.window, config.max_message_len()),
            flight: Flight::new(config.max_flight_messages),
            timer: RetransmitTimer::new(config.initial_timeout, config.max_timeouts),
            mtu: config.mtu,
            handshake_write_seq: 0,
            write_epoch: 0,
            write_epochs: BTreeSet::from([0]),
            has_change_cipher_spec: false,
            handshake_complete: false,
            metrics: Metrics::new(),
            reorder: ReorderTracker::new(),
            config,
            record_layer,
            transport,
            transcript,
        })
    }

    // === Inbound ===

    /// Process the records in a datagram.
    ///
    /// Stops after a ChangeCipherSpec; feed `&datagram[feed.consumed..]`
    /// again once new read keys are installed.
    ///
    /// # Errors
    /// Decode and protocol errors are fatal; the caller should send
    /// [`Error::alert`] and close the connection.
    pub fn feed_datagram(&mut self, datagram: &[u8]) -> Result<Feed> {
        self.metrics.datagrams_received += 1;

        let mut consumed = 0;
        let mut status = FeedStatus::Discarded;
        while consumed < datagram.len() {
            let opened = self.record_layer.open(&datagram[consumed..])?;
            if opened.consumed() == 0 {
                return Err(Error::Internal("record layer consumed no input"));
            }
            consumed += opened.consumed();

            let record = match opened {
                Opened::Record(record) => record,
                Opened::Discard { .. } => {
                    self.metrics.records_discarded += 1;
                    continue;
                }
            };
            self.metrics.records_received += 1;

            let is_ccs = record.content_type == ContentType::ChangeCipherSpec;
            if self.process_record(record)? == FeedStatus::Accepted {
                status = FeedStatus::Accepted;
                if is_ccs {
                    break;
                }
            }
        }

        Ok(Feed { status, consumed })
    }

    fn process_record(&mut self, record: OpenedRecord) -> Result<FeedStatus> {
        match record.content_type {
            ContentType::Handshake if self.handshake_complete => self.process_post_handshake(&record),
            ContentType::Handshake => self.process_handshake_record(&record),
            ContentType::ChangeCipherSpec => {
                if record.encrypted {
                    return Err(ProtocolError::EncryptedChangeCipherSpec.into());
                }
                if record.payload != CHANGE_CIPHER_SPEC_PAYLOAD {
                    return Err(ProtocolError::BadChangeCipherSpec {
                        len: record.payload.len(),
                    }
                    .into());
                }
                if self.handshake_complete {
                    trace!("ignoring ChangeCipherSpec after handshake");
                    return Ok(FeedStatus::Discarded);
                }
                debug!("received ChangeCipherSpec in epoch {}", record.epoch);
                self.has_change_cipher_spec = true;
                Ok(FeedStatus::Accepted)
            }
            ContentType::ApplicationData if record.encrypted => {
                trace!("discarding {} bytes of application data", record.payload.len());
                Ok(FeedStatus::Discarded)
            }
            other => Err(ProtocolError::UnexpectedRecord {
                content_type: other.into(),
            }
            .into()),
        }
    }

    fn process_handshake_record(&mut self, record: &OpenedRecord) -> Result<FeedStatus> {
        let mut status = FeedStatus::Discarded;
        let mut rest = record.payload.as_slice();

        while !rest.is_empty() {
            let (header, body, tail) = FragmentHeader::parse(rest)?;
            rest = tail;
            self.metrics.fragments_received += 1;

            // The DTLS 1.2 encrypted epoch carries only the final message of a flight.
            let expected = self.incoming.read_seq();
            if self.config.version == ProtocolVersion::Dtls12
                && record.epoch == 1
                && header.seq != expected
            {
                return Err(ProtocolError::UnexpectedMessage {
                    seq: header.seq,
                    epoch: record.epoch,
                    expected,
                }
                .into());
            }

            trace!(
                "{} seq {} [{}, +{}) of {}",
                handshake_type::name(header.msg_type),
                header.seq,
                header.frag_off,
                header.frag_len,
                header.msg_len
            );

            match self.incoming.process_fragment(&header, body)? {
                disposition @ (FragmentDisposition::Buffered | FragmentDisposition::Completed) => {
                    status = FeedStatus::Accepted;
                    if self.reorder.track(header.seq, header.frag_off as usize, header.frag_end()) {
                        self.metrics.fragments_reordered += 1;
                    }
                    if disposition == FragmentDisposition::Completed {
                        self.metrics.messages_completed += 1;
                    }
                }
                FragmentDisposition::Duplicate => self.metrics.fragments_duplicate += 1,
                FragmentDisposition::Stale => self.metrics.fragments_stale += 1,
                FragmentDisposition::BeyondWindow => self.metrics.fragments_beyond_window += 1,
            }
        }

        Ok(status)
    }

    /// After the handshake only a retransmitted peer Finished is expected.
    /// It means our final flight was lost, so resend it.
    fn process_post_handshake(&mut self, record: &OpenedRecord) -> Result<FeedStatus> {
        let (header, _, _) = FragmentHeader::parse(&record.payload)?;
        let last_seq = self.incoming.read_seq().wrapping_sub(1);

        if header.msg_type == handshake_type::FINISHED && header.seq == last_seq {
            // Only the first fragment triggers, in case Finished was fragmented.
            if header.frag_off == 0 && !self.flight.is_empty() {
                debug!("peer retransmitted Finished; resending final flight");
                self.timer.record_timeout()?;
                self.retransmit_flight()?;
            }
            return Ok(FeedStatus::Discarded);
        }

        Err(ProtocolError::UnexpectedRecord {
            content_type: ContentType::Handshake.into(),
        }
        .into())
    }

    /// The next handshake message, once it has fully arrived.
    pub fn next_complete_message(&self) -> Option<Message<'_>> {
        self.incoming.current_message()
    }

    /// Release the current message. Returns false if there is none.
    pub fn advance_to_next_message(&mut self) -> bool {
        let seq = self.incoming.read_seq();
        if !self.incoming.advance() {
            return false;
        }
        self.reorder.clear_message(seq);
        self.metrics.messages_consumed += 1;
        true
    }

    /// True if data for messages after the current one is buffered.
    pub fn has_pending_data(&self) -> bool {
        self.incoming.has_pending_data()
    }

    /// Consume the "ChangeCipherSpec received" flag.
    pub fn take_change_cipher_spec(&mut self) -> bool {
        std::mem::take(&mut self.has_change_cipher_spec)
    }

    // === Outbound ===

    /// Queue an encoded message (or a ChangeCipherSpec) under the current write epoch.
    ///
    /// Handshake messages are added to the transcript here, once; the write
    /// sequence number advances past them.
    pub fn enqueue_outgoing(&mut self, message: Vec<u8>, is_ccs: bool) -> Result<()> {
        let started_new = self.flight.enqueue(message, self.write_epoch, is_ccs)?;
        if started_new {
            self.timer.stop();
            self.sweep_write_epochs();
        }

        if !is_ccs {
            if let Some(queued) = self.flight.last_message() {
                self.transcript.update(queued);
            }
            self.handshake_write_seq = self.handshake_write_seq.wrapping_add(1);
        }
        self.metrics.messages_enqueued += 1;
        Ok(())
    }

    /// Encode `body` with the next write sequence number and queue it.
    pub fn add_message(&mut self, msg_type: u8, body: &[u8]) -> Result<()> {
        let message = encode_message(msg_type, self.handshake_write_seq, body)?;
        self.enqueue_outgoing(message, false)
    }

    /// Queue a ChangeCipherSpec.
    pub fn add_change_cipher_spec(&mut self) -> Result<()> {
        self.enqueue_outgoing(Vec::new(), true)
    }

    /// Close the current flight, arm the timer and start sending it.
    pub fn close_flight(&mut self, now: Instant) -> Result<FlightStatus> {
        if self.flight.close() {
            debug!(
                "flight of {} messages closed; timeout {:?}",
                self.flight.len(),
                self.timer.current_timeout()
            );
            self.timer.start(now);
            self.metrics.flights_sent += 1;
        }
        self.flush()
    }

    /// Send whatever part of the flight has not gone out yet.
    pub fn flush(&mut self) -> Result<FlightStatus> {
        let summary = self
            .flight
            .send(&mut self.record_layer, &mut self.transport, self.mtu)?;

        self.metrics.packets_sent += summary.packets as u64;
        self.metrics.bytes_sent += summary.bytes as u64;
        if summary.status == FlightStatus::WouldBlock {
            trace!("transport blocked at cursor {:?}", self.flight.cursor());
            self.metrics.write_blocked += 1;
        }
        Ok(summary.status)
    }

    /// Resend the whole flight from its first byte.
    pub fn retransmit_flight(&mut self) -> Result<FlightStatus> {
        if self.flight.is_empty() {
            return Ok(FlightStatus::Sent);
        }
        self.flight.rewind();
        self.metrics.retransmissions += 1;
        self.flush()
    }

    /// Retransmit if the timer has expired at `now`.
    ///
    /// # Returns
    /// `None` if the timer had not expired, otherwise the send status.
    ///
    /// # Errors
    /// Returns `Error::TimedOut` once the retransmission limit is exceeded.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<Option<FlightStatus>> {
        if !self.timer.is_expired(now) {
            return Ok(None);
        }

        if let Err(err) = self.timer.back_off(now) {
            warn!("handshake timed out: {}", err);
            return Err(err);
        }
        if self.timer.timeouts() > MTU_FALLBACK_TIMEOUTS {
            self.apply_fallback_mtu();
        }

        debug!(
            "retransmission timer expired ({} timeouts), next in {:?}",
            self.timer.timeouts(),
            self.timer.current_timeout()
        );
        self.retransmit_flight().map(Some)
    }

    fn apply_fallback_mtu(&mut self) {
        if let Some(fallback) = self.config.fallback_mtu {
            if fallback < self.mtu {
                warn!("repeated timeouts; lowering MTU from {} to {}", self.mtu, fallback);
                self.mtu = fallback;
            }
        }
    }

    /// When the retransmission timer fires next.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Stop retransmitting. The final flight is kept so a retransmitted
    /// peer Finished can still trigger a resend.
    pub fn finish_handshake(&mut self) {
        debug!("handshake complete");
        self.handshake_complete = true;
        self.timer.stop();
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    // === Epochs ===

    /// Make `epoch` the write epoch for subsequently queued messages.
    pub fn set_write_epoch(&mut self, epoch: u16) {
        debug!("write epoch {} -> {}", self.write_epoch, epoch);
        self.write_epochs.insert(epoch);
        self.write_epoch = epoch;
        self.sweep_write_epochs();
    }

    /// Release write epochs that are neither current nor needed by the flight.
    fn sweep_write_epochs(&mut self) {
        let retired: Vec<u16> = self
            .write_epochs
            .iter()
            .copied()
            .filter(|&epoch| epoch != self.write_epoch && !self.flight.references_epoch(epoch))
            .collect();

        for epoch in retired {
            debug!("discarding write epoch {}", epoch);
            self.write_epochs.remove(&epoch);
            self.record_layer.discard_write_epoch(epoch);
        }
    }

    pub fn write_epoch(&self) -> u16 {
        self.write_epoch
    }

    // === MTU ===

    /// Smallest MTU any connection accepts.
    pub const fn min_mtu() -> usize {
        MIN_MTU
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Change the MTU used for subsequent packets.
    pub fn set_mtu(&mut self, mtu: usize) -> Result<()> {
        if mtu < MIN_MTU {
            return Err(Error::Config(format!("mtu {} below minimum {}", mtu, MIN_MTU)));
        }
        self.mtu = mtu;
        Ok(())
    }

    // === Accessors ===

    pub fn handshake_read_seq(&self) -> u16 {
        self.incoming.read_seq()
    }

    pub fn handshake_write_seq(&self) -> u16 {
        self.handshake_write_seq
    }

    pub fn flight(&self) -> &Flight {
        &self.flight
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn record_layer(&self) -> &R {
        &self.record_layer
    }

    pub fn record_layer_mut(&mut self) -> &mut R {
        &mut self.record_layer
    }

    pub fn transport(&self) -> &W {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut W {
        &mut self.transport
    }

    pub fn transcript(&self) -> &H {
        &self.transcript
    }
}
