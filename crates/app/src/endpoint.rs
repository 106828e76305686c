//! One side of the simulated handshake.
//!
//! An [`Endpoint`] walks its script against a [`Connection`]: it queues and
//! closes flights, checks every reassembled message against what the peer
//! sent, and switches record-layer epochs around ChangeCipherSpec.

use crate::error::SimError;
use crate::script::Action;
use dtls_flight_core::config::HandshakeConfig;
use dtls_flight_core::fragment::handshake_type;
use dtls_flight_core::metrics::Metrics;
use dtls_flight_core::record::PlaintextRecordLayer;
use dtls_flight_core::transport::MemoryTransport;
use dtls_flight_core::Connection;
use log::{debug, info};
use std::collections::VecDeque;
use std::time::Instant;

type SimConnection = Connection<PlaintextRecordLayer, MemoryTransport, Vec<u8>>;

pub struct Endpoint {
    name: &'static str,
    conn: SimConnection,
    actions: VecDeque<Action>,

    /// Packets the transport accepts per tick (None = unlimited)
    send_budget: Option<usize>,

    messages_verified: usize,
}

impl Endpoint {
    pub fn new(
        name: &'static str,
        config: HandshakeConfig,
        actions: Vec<Action>,
        send_budget: Option<usize>,
    ) -> Result<Self, SimError> {
        let mut transport = MemoryTransport::new();
        transport.set_budget(send_budget);

        let conn = Connection::new(config, PlaintextRecordLayer::new(), transport, Vec::new())
            .map_err(SimError::connection(name))?;

        Ok(Self {
            name,
            conn,
            actions: actions.into(),
            send_budget,
            messages_verified: 0,
        })
    }

    /// Run script steps until one has to wait for the peer.
    ///
    /// Once the script is exhausted the handshake is marked complete.
    pub fn step(&mut self, now: Instant) -> Result<(), SimError> {
        let name = self.name;

        while let Some(action) = self.actions.front() {
            match action {
                Action::Send { msg_type, body } => {
                    self.conn
                        .add_message(*msg_type, body)
                        .map_err(SimError::connection(name))?;
                }
                Action::SendChangeCipherSpec => {
                    self.conn
                        .add_change_cipher_spec()
                        .map_err(SimError::connection(name))?;
                    let next_epoch = self.conn.write_epoch() + 1;
                    self.conn.set_write_epoch(next_epoch);
                }
                Action::CloseFlight => {
                    self.conn.close_flight(now).map_err(SimError::connection(name))?;
                }
                Action::Receive { msg_type, body } => {
                    let Some(message) = self.conn.next_complete_message() else {
                        return Ok(());
                    };
                    if message.msg_type != *msg_type {
                        return Err(SimError::UnexpectedMessage {
                            endpoint: name,
                            expected: handshake_type::name(*msg_type),
                            actual: handshake_type::name(message.msg_type),
                        });
                    }
                    if message.body != body.as_slice() {
                        return Err(SimError::BodyMismatch {
                            endpoint: name,
                            msg_type: handshake_type::name(*msg_type),
                        });
                    }
                    debug!(
                        "{}: verified {} seq {} ({} bytes)",
                        name,
                        handshake_type::name(message.msg_type),
                        message.seq,
                        message.body.len()
                    );
                    self.conn.advance_to_next_message();
                    self.messages_verified += 1;
                }
                Action::ReceiveChangeCipherSpec => {
                    if !self.conn.take_change_cipher_spec() {
                        return Ok(());
                    }
                    let record_layer = self.conn.record_layer_mut();
                    let next_epoch = record_layer.read_epoch() + 1;
                    record_layer.set_read_epoch(next_epoch);
                    debug!("{}: read epoch now {}", name, next_epoch);
                }
            }
            self.actions.pop_front();
        }

        if !self.conn.is_handshake_complete() {
            self.conn.finish_handshake();
            info!("{}: handshake complete", name);
        }
        Ok(())
    }

    /// Handle one datagram from the peer.
    ///
    /// The connection stops after a ChangeCipherSpec; the script gets a chance
    /// to install the next read epoch before the rest of the datagram is fed.
    pub fn on_datagram(&mut self, datagram: &[u8], now: Instant) -> Result<(), SimError> {
        let mut rest = datagram;
        loop {
            let feed = self
                .conn
                .feed_datagram(rest)
                .map_err(SimError::connection(self.name))?;
            self.step(now)?;

            rest = &rest[feed.consumed..];
            if rest.is_empty() {
                return Ok(());
            }
        }
    }

    /// Refill the send budget, resume a blocked flight and fire the timer.
    pub fn on_tick(&mut self, now: Instant) -> Result<(), SimError> {
        self.conn.transport_mut().set_budget(self.send_budget);

        if !self.conn.flight().is_fully_written() {
            self.conn.flush().map_err(SimError::connection(self.name))?;
        }
        self.conn
            .handle_timeout(now)
            .map_err(SimError::connection(self.name))?;
        Ok(())
    }

    /// Packets written since the last call.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        self.conn.transport_mut().drain()
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.conn.next_timeout()
    }

    /// True while part of a closed flight is still waiting for the transport.
    pub fn has_unsent(&self) -> bool {
        self.conn.flight().is_closed() && !self.conn.flight().is_fully_written()
    }

    /// True once every step of the script has run.
    pub fn is_finished(&self) -> bool {
        self.actions.is_empty() && self.conn.is_handshake_complete()
    }

    pub fn messages_verified(&self) -> usize {
        self.messages_verified
    }

    pub fn metrics(&self) -> &Metrics {
        self.conn.metrics()
    }

    /// Bytes of handshake messages this endpoint sent, as hashed.
    pub fn transcript_len(&self) -> usize {
        self.conn.transcript().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::HandshakeScript;

    fn pair(budget: Option<usize>) -> (Endpoint, Endpoint) {
        let script = HandshakeScript::generate(5, 3000);
        let client = Endpoint::new(
            "client",
            HandshakeConfig::client(),
            script.client_actions(),
            budget,
        )
        .unwrap();
        let server = Endpoint::new(
            "server",
            HandshakeConfig::server(),
            script.server_actions(),
            budget,
        )
        .unwrap();
        (client, server)
    }

    fn deliver(from: &mut Endpoint, to: &mut Endpoint, now: Instant) {
        for datagram in from.take_outgoing() {
            to.on_datagram(&datagram, now).unwrap();
        }
    }

    #[test]
    fn test_lossless_handshake() {
        let now = Instant::now();
        let (mut client, mut server) = pair(None);

        client.step(now).unwrap();
        server.step(now).unwrap();
        deliver(&mut client, &mut server, now);
        assert_eq!(server.messages_verified(), 1);

        deliver(&mut server, &mut client, now);
        assert_eq!(client.messages_verified(), 4);

        deliver(&mut client, &mut server, now);
        assert!(server.is_finished());
        assert_eq!(server.messages_verified(), 3);

        deliver(&mut server, &mut client, now);
        assert!(client.is_finished());
        assert_eq!(client.messages_verified(), 5);
    }

    #[test]
    fn test_blocked_flight_resumes_on_tick() {
        let now = Instant::now();
        let (mut client, mut server) = pair(Some(1));

        client.step(now).unwrap();
        server.step(now).unwrap();
        deliver(&mut client, &mut server, now);

        // The 3000-byte certificate needs several packets; one goes out per tick.
        assert!(server.has_unsent());
        let mut ticks = 0;
        while server.has_unsent() {
            deliver(&mut server, &mut client, now);
            server.on_tick(now).unwrap();
            ticks += 1;
            assert!(ticks < 20);
        }
        deliver(&mut server, &mut client, now);
        assert_eq!(client.messages_verified(), 4);
    }

    #[test]
    fn test_server_resends_final_flight() {
        let now = Instant::now();
        let (mut client, mut server) = pair(None);

        client.step(now).unwrap();
        server.step(now).unwrap();
        deliver(&mut client, &mut server, now);
        deliver(&mut server, &mut client, now);

        let client_flight = client.take_outgoing();
        for datagram in &client_flight {
            server.on_datagram(datagram, now).unwrap();
        }
        assert!(server.is_finished());

        // Final server flight lost; the client's retransmitted Finished brings it back.
        let lost = server.take_outgoing();
        assert!(!lost.is_empty());
        for datagram in &client_flight {
            server.on_datagram(datagram, now).unwrap();
        }
        deliver(&mut server, &mut client, now);
        assert!(client.is_finished());
    }

    #[test]
    fn test_wrong_body_is_reported() {
        let now = Instant::now();
        let script = HandshakeScript::generate(5, 3000);
        let other = HandshakeScript::generate(6, 3000);
        let mut client = Endpoint::new(
            "client",
            HandshakeConfig::client(),
            script.client_actions(),
            None,
        )
        .unwrap();
        let mut server = Endpoint::new(
            "server",
            HandshakeConfig::server(),
            other.server_actions(),
            None,
        )
        .unwrap();

        client.step(now).unwrap();
        server.step(now).unwrap();
        let datagram = client.take_outgoing().remove(0);
        let err = server.on_datagram(&datagram, now).unwrap_err();
        assert!(matches!(err, SimError::BodyMismatch { endpoint: "server", .. }));
    }
}
