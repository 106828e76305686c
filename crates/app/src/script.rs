//! Handshake script generation.
//!
//! Both endpoints run from the same seeded script: a DTLS 1.2 full handshake
//! with random message bodies. Each side knows what it sends and what it
//! expects to receive, so every reassembled body can be checked byte for byte.
//!
//! ```text
//! client                                  server
//! ClientHello                 -------->
//!                                         ServerHello
//!                                         Certificate
//!                                         ServerKeyExchange
//!                             <--------   ServerHelloDone
//! ClientKeyExchange
//! [ChangeCipherSpec]
//! Finished                    -------->
//!                                         [ChangeCipherSpec]
//!                             <--------   Finished
//! ```

use dtls_flight_core::fragment::handshake_type;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// One step of an endpoint's script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Queue a handshake message
    Send { msg_type: u8, body: Vec<u8> },
    /// Queue a ChangeCipherSpec and switch to the next write epoch
    SendChangeCipherSpec,
    /// Close the flight and start sending it
    CloseFlight,
    /// Wait for a handshake message and check its body
    Receive { msg_type: u8, body: Vec<u8> },
    /// Wait for the peer's ChangeCipherSpec and switch to the next read epoch
    ReceiveChangeCipherSpec,
}

/// Message bodies of one full handshake.
#[derive(Debug, Clone)]
pub struct HandshakeScript {
    pub client_hello: Vec<u8>,
    pub server_hello: Vec<u8>,
    pub certificate: Vec<u8>,
    pub server_key_exchange: Vec<u8>,
    pub client_key_exchange: Vec<u8>,
    pub client_finished: Vec<u8>,
    pub server_finished: Vec<u8>,
}

/// Finished messages carry a 12-byte verify_data.
const VERIFY_DATA_LEN: usize = 12;

impl HandshakeScript {
    /// Generate message bodies.
    ///
    /// # Arguments
    /// - `seed`: random seed for determinism
    /// - `certificate_len`: size of the Certificate body
    pub fn generate(seed: u64, certificate_len: usize) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let client_hello_len = rng.gen_range(100..=300);
        let server_hello_len = rng.gen_range(70..=120);
        let key_exchange_len = rng.gen_range(150..=400);
        let client_key_exchange_len = rng.gen_range(66..=130);

        Self {
            client_hello: random_body(&mut rng, client_hello_len),
            server_hello: random_body(&mut rng, server_hello_len),
            certificate: certificate_chain(&mut rng, certificate_len),
            server_key_exchange: random_body(&mut rng, key_exchange_len),
            client_key_exchange: random_body(&mut rng, client_key_exchange_len),
            client_finished: random_body(&mut rng, VERIFY_DATA_LEN),
            server_finished: random_body(&mut rng, VERIFY_DATA_LEN),
        }
    }

    /// Client steps, in order.
    pub fn client_actions(&self) -> Vec<Action> {
        vec![
            send(handshake_type::CLIENT_HELLO, &self.client_hello),
            Action::CloseFlight,
            receive(handshake_type::SERVER_HELLO, &self.server_hello),
            receive(handshake_type::CERTIFICATE, &self.certificate),
            receive(handshake_type::SERVER_KEY_EXCHANGE, &self.server_key_exchange),
            receive(handshake_type::SERVER_HELLO_DONE, &[]),
            send(handshake_type::CLIENT_KEY_EXCHANGE, &self.client_key_exchange),
            Action::SendChangeCipherSpec,
            send(handshake_type::FINISHED, &self.client_finished),
            Action::CloseFlight,
            Action::ReceiveChangeCipherSpec,
            receive(handshake_type::FINISHED, &self.server_finished),
        ]
    }

    /// Server steps, in order.
    pub fn server_actions(&self) -> Vec<Action> {
        vec![
            receive(handshake_type::CLIENT_HELLO, &self.client_hello),
            send(handshake_type::SERVER_HELLO, &self.server_hello),
            send(handshake_type::CERTIFICATE, &self.certificate),
            send(handshake_type::SERVER_KEY_EXCHANGE, &self.server_key_exchange),
            send(handshake_type::SERVER_HELLO_DONE, &[]),
            Action::CloseFlight,
            receive(handshake_type::CLIENT_KEY_EXCHANGE, &self.client_key_exchange),
            Action::ReceiveChangeCipherSpec,
            receive(handshake_type::FINISHED, &self.client_finished),
            Action::SendChangeCipherSpec,
            send(handshake_type::FINISHED, &self.server_finished),
            Action::CloseFlight,
        ]
    }

    /// Total handshake body bytes in both directions.
    pub fn total_bytes(&self) -> usize {
        [
            &self.client_hello,
            &self.server_hello,
            &self.certificate,
            &self.server_key_exchange,
            &self.client_key_exchange,
            &self.client_finished,
            &self.server_finished,
        ]
        .iter()
        .map(|body| body.len())
        .sum()
    }
}

fn send(msg_type: u8, body: &[u8]) -> Action {
    Action::Send {
        msg_type,
        body: body.to_vec(),
    }
}

fn receive(msg_type: u8, body: &[u8]) -> Action {
    Action::Receive {
        msg_type,
        body: body.to_vec(),
    }
}

fn random_body(rng: &mut ChaCha8Rng, len: usize) -> Vec<u8> {
    (0..len).map(|_| rng.gen()).collect()
}

/// Certificate-shaped body: a run of length-prefixed random "certificates".
fn certificate_chain(rng: &mut ChaCha8Rng, len: usize) -> Vec<u8> {
    let mut body = Vec::with_capacity(len);
    while body.len() < len {
        let remaining = len - body.len();
        if remaining < 4 {
            body.extend((0..remaining).map(|_| rng.gen::<u8>()));
            break;
        }
        let cert_len = rng.gen_range(1..=remaining - 3).min(2048);
        body.extend_from_slice(&(cert_len as u32).to_be_bytes()[1..]);
        body.extend((0..cert_len).map(|_| rng.gen::<u8>()));
    }
    body
}
