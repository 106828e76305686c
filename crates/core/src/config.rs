//! Per-connection configuration for the handshake message layer.
//!
//! Defaults follow common DTLS deployments: a 1500-byte Ethernet MTU minus
//! IPv4/UDP headers, a one-second initial retransmission timeout, and a
//! seven-message reassembly window.

use crate::error::{Error, Result};
use crate::timer::MAX_TIMEOUT;
use std::time::Duration;

/// Smallest MTU a connection accepts: 256 bytes minus IPv4 and UDP headers.
pub const MIN_MTU: usize = 256 - 28;

/// MTU used when none is configured: Ethernet minus IPv4 and UDP headers.
pub const DEFAULT_MTU: usize = 1500 - 28;

/// Maximum number of messages in one flight, and the reassembly window size.
pub const MAX_HANDSHAKE_FLIGHT: usize = 7;

/// Largest message accepted when certificate chains are not expected.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 16384;

/// Default cap on certificate-bearing messages.
pub const DEFAULT_MAX_CERT_LIST: usize = 1024 * 100;

/// Default initial retransmission timeout.
pub const DEFAULT_INITIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Retransmissions allowed before the handshake fails.
pub const DEFAULT_MAX_TIMEOUTS: u32 = 12;

/// Which side of the handshake this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Protocol version in use; only DTLS 1.2 restricts the encrypted epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    Dtls12,
    Dtls13,
}

/// Configuration for a single connection.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Which side of the handshake
    pub role: Role,

    /// Negotiated protocol version
    pub version: ProtocolVersion,

    /// Path MTU available to DTLS records
    pub mtu: usize,

    /// MTU to fall back to after repeated timeouts
    pub fallback_mtu: Option<usize>,

    /// Number of reassembly slots
    pub window: usize,

    /// Maximum messages in an outgoing flight
    pub max_flight_messages: usize,

    /// Cap on certificate-bearing messages
    pub max_cert_list: usize,

    /// Whether a server requests a client certificate
    pub verify_peer: bool,

    /// First retransmission timeout
    pub initial_timeout: Duration,

    /// Retransmissions before giving up
    pub max_timeouts: u32,
}

impl HandshakeConfig {
    /// Default configuration for a client.
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            ..Self::default()
        }
    }

    /// Default configuration for a server.
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            ..Self::default()
        }
    }

    /// Largest incoming message this connection will buffer.
    ///
    /// Clients always accept certificate chains; servers only when they
    /// request client certificates.
    pub fn max_message_len(&self) -> usize {
        let expects_certificates = self.role == Role::Client || self.verify_peer;
        if expects_certificates {
            self.max_cert_list.max(DEFAULT_MAX_MESSAGE_LEN)
        } else {
            DEFAULT_MAX_MESSAGE_LEN
        }
    }

    /// Reject configurations the connection cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.mtu < MIN_MTU {
            return Err(Error::Config(format!(
                "mtu {} below minimum {}",
                self.mtu, MIN_MTU
            )));
        }
        if let Some(fallback) = self.fallback_mtu {
            if fallback < MIN_MTU {
                return Err(Error::Config(format!(
                    "fallback mtu {} below minimum {}",
                    fallback, MIN_MTU
                )));
            }
        }
        if self.window == 0 {
            return Err(Error::Config("reassembly window must be positive".to_string()));
        }
        if self.max_flight_messages == 0 {
            return Err(Error::Config("flight capacity must be positive".to_string()));
        }
        if self.initial_timeout.is_zero() {
            return Err(Error::Config("initial timeout must be positive".to_string()));
        }
        if self.initial_timeout > MAX_TIMEOUT {
            return Err(Error::Config(format!(
                "initial timeout {:?} above maximum {:?}",
                self.initial_timeout, MAX_TIMEOUT
            )));
        }
        Ok(())
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            role: Role::Client,
            version: ProtocolVersion::Dtls12,
            mtu: DEFAULT_MTU,
            fallback_mtu: None,
            window: MAX_HANDSHAKE_FLIGHT,
            max_flight_messages: MAX_HANDSHAKE_FLIGHT,
            max_cert_list: DEFAULT_MAX_CERT_LIST,
            verify_peer: false,
            initial_timeout: DEFAULT_INITIAL_TIMEOUT,
            max_timeouts: DEFAULT_MAX_TIMEOUTS,
        }
    }
}
