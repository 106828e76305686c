//! dtls-flight-core: DTLS handshake message reassembly and flight retransmission
//!
//! This library turns an unreliable, reordering, duplicating datagram stream
//! into an ordered stream of handshake messages, and packs outgoing handshake
//! flights into MTU-sized packets that are retransmitted as a unit:
//! - Tracks received byte ranges of each message with a compact bitmap
//! - Reassembles fragments inside a bounded window of upcoming messages
//! - Packs outgoing messages into records and packets, fragmenting as needed
//! - Retransmits whole flights on an exponential-backoff timer
//!
//! # Architecture
//!
//! The system is designed around clear module boundaries:
//! - `bitmap`: Received-range bitmap
//! - `fragment`: 12-byte handshake fragment header codec
//! - `reassembly`: Inbound message window
//! - `flight`: Outbound flight packing and cursor
//! - `record`: Record-layer trait and a plaintext reference implementation
//! - `transport`: Datagram transport and transcript traits
//! - `timer`: Retransmission timer
//! - `connection`: Per-connection context wiring the above together
//! - `network`: Network simulator with seeded randomness
//! - `metrics`: Observable connection behavior
//!
//! # Design Principles
//!
//! - **No panics**: All errors are structured and carry the alert to send
//! - **Bounded memory**: Fixed reassembly window, capped flights and messages
//! - **Non-blocking**: Would-block resumes from the packet that did not go out
//! - **Deterministic**: Time is always supplied by the caller

pub mod bitmap;
pub mod config;
pub mod connection;
pub mod error;
pub mod flight;
pub mod fragment;
pub mod metrics;
pub mod network;
pub mod reassembly;
pub mod record;
pub mod timer;
pub mod transport;

// Re-export commonly used types
pub use config::HandshakeConfig;
pub use connection::{Connection, Feed, FeedStatus};
pub use error::{Error, Result};
pub use flight::FlightStatus;
