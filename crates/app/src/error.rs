//! Errors that end a simulated handshake.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("{endpoint}: {source}")]
    Connection {
        endpoint: &'static str,
        source: dtls_flight_core::Error,
    },

    #[error("{endpoint}: expected {expected}, received {actual}")]
    UnexpectedMessage {
        endpoint: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("{endpoint}: {msg_type} body differs from what the peer sent")]
    BodyMismatch {
        endpoint: &'static str,
        msg_type: &'static str,
    },

    #[error("no datagrams in flight and no timers armed at {at_ms} ms")]
    Stalled { at_ms: u64 },

    #[error("handshake still running after {limit_ms} ms")]
    TimeLimit { limit_ms: u64 },
}

impl SimError {
    /// Wrap a connection error with the endpoint it came from.
    pub fn connection(endpoint: &'static str) -> impl Fn(dtls_flight_core::Error) -> Self {
        move |source| SimError::Connection { endpoint, source }
    }

    /// Alert the failing endpoint would send, if the failure has one.
    pub fn alert(&self) -> Option<dtls_flight_core::error::AlertDescription> {
        match self {
            SimError::Connection { source, .. } => source.alert(),
            _ => None,
        }
    }
}
