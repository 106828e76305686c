//! Datagram transport and handshake transcript seams.
//!
//! A transport send either writes the whole packet, reports would-block
//! (`io::ErrorKind::WouldBlock`, or `Ok(0)`), or fails. Would-block is not an
//! error for the handshake layer: the flight is resumed later from the packet
//! that did not go out.

use std::collections::VecDeque;
use std::io;
use std::net::UdpSocket;

/// Outbound datagram sink.
pub trait DatagramTransport {
    /// Send one packet. Returns the number of bytes written.
    fn send(&mut self, packet: &[u8]) -> io::Result<usize>;
}

/// Connected UDP sockets send to their peer.
impl DatagramTransport for UdpSocket {
    fn send(&mut self, packet: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, packet)
    }
}

impl<T: DatagramTransport + ?Sized> DatagramTransport for &mut T {
    fn send(&mut self, packet: &[u8]) -> io::Result<usize> {
        (**self).send(packet)
    }
}

/// In-memory transport that captures packets.
///
/// An optional budget limits how many packets are accepted before sends
/// report would-block, until [`MemoryTransport::set_budget`] refills it.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: VecDeque<Vec<u8>>,
    budget: Option<usize>,
    blocked: u64,
}

impl MemoryTransport {
    /// Create a transport that never blocks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept at most `packets` more sends before blocking; `None` removes the limit.
    pub fn set_budget(&mut self, packets: Option<usize>) {
        self.budget = packets;
    }

    /// Take every captured packet, oldest first.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.sent.drain(..).collect()
    }

    /// Captured packets not yet drained.
    pub fn sent(&self) -> impl Iterator<Item = &[u8]> {
        self.sent.iter().map(Vec::as_slice)
    }

    pub fn pending_count(&self) -> usize {
        self.sent.len()
    }

    /// Number of sends refused with would-block.
    pub fn blocked_count(&self) -> u64 {
        self.blocked
    }
}

impl DatagramTransport for MemoryTransport {
    fn send(&mut self, packet: &[u8]) -> io::Result<usize> {
        if let Some(budget) = self.budget.as_mut() {
            if *budget == 0 {
                self.blocked += 1;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            *budget -= 1;
        }
        self.sent.push_back(packet.to_vec());
        Ok(packet.len())
    }
}

/// Running handshake transcript.
///
/// Every outgoing handshake message is appended exactly once, at enqueue
/// time; retransmissions never touch the transcript.
pub trait Transcript {
    fn update(&mut self, message: &[u8]);
}

/// Keeps the raw transcript bytes.
impl Transcript for Vec<u8> {
    fn update(&mut self, message: &[u8]) {
        self.extend_from_slice(message);
    }
}

/// Discards the transcript.
impl Transcript for () {
    fn update(&mut self, _message: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_transport_captures() {
        let mut transport = MemoryTransport::new();
        assert_eq!(transport.send(b"one").unwrap(), 3);
        assert_eq!(transport.send(b"two").unwrap(), 3);
        assert_eq!(transport.pending_count(), 2);
        assert_eq!(transport.drain(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(transport.pending_count(), 0);
    }

    #[test]
    fn test_budget_blocks() {
        let mut transport = MemoryTransport::new();
        transport.set_budget(Some(1));
        assert!(transport.send(b"first").is_ok());

        let err = transport.send(b"second").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(transport.blocked_count(), 1);

        transport.set_budget(None);
        assert!(transport.send(b"second").is_ok());
        assert_eq!(transport.pending_count(), 2);
    }

    #[test]
    fn test_vec_transcript() {
        let mut transcript = Vec::new();
        transcript.update(b"abc");
        transcript.update(b"def");
        assert_eq!(transcript, b"abcdef");
    }

    #[test]
    fn test_udp_socket_transport() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.connect(receiver.local_addr().unwrap()).unwrap();

        assert_eq!(DatagramTransport::send(&mut sender, b"datagram").unwrap(), 8);

        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"datagram");
    }
}
