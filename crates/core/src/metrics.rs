//! Metrics collection and reporting for a handshake connection.
//!
//! This module provides observable insights into connection behavior:
//! - Inbound datagram, record and fragment counts
//! - How fragments were disposed of (buffered, stale, duplicate, ...)
//! - Outbound packets, bytes and retransmissions
//!
//! # Thread Safety
//!
//! The `Metrics` struct is NOT thread-safe. Each connection owns its own.

use std::collections::HashMap;

/// Counters for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    // === Inbound ===
    /// Datagrams handed to the connection
    pub datagrams_received: u64,

    /// Records the record layer opened
    pub records_received: u64,

    /// Records the record layer discarded
    pub records_discarded: u64,

    /// Handshake fragments parsed
    pub fragments_received: u64,

    /// Fragments that arrived behind a later fragment of the same message
    pub fragments_reordered: u64,

    /// Fragments of messages already consumed
    pub fragments_stale: u64,

    /// Fragments too far ahead of the window
    pub fragments_beyond_window: u64,

    /// Fragments of messages already complete
    pub fragments_duplicate: u64,

    /// Messages fully reassembled
    pub messages_completed: u64,

    /// Messages consumed by the caller
    pub messages_consumed: u64,

    // === Outbound ===
    /// Messages queued into flights (including ChangeCipherSpec)
    pub messages_enqueued: u64,

    /// Flights closed and started
    pub flights_sent: u64,

    /// Packets written to the transport
    pub packets_sent: u64,

    /// Bytes written to the transport
    pub bytes_sent: u64,

    /// Whole-flight retransmissions
    pub retransmissions: u64,

    /// Sends that stopped on would-block
    pub write_blocked: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of received fragments that were already complete or consumed.
    pub fn redundant_fragment_rate(&self) -> f64 {
        if self.fragments_received == 0 {
            0.0
        } else {
            (self.fragments_duplicate + self.fragments_stale) as f64
                / self.fragments_received as f64
        }
    }

    /// Compute fragment reorder rate (reordered / received).
    pub fn reorder_rate(&self) -> f64 {
        if self.fragments_received == 0 {
            0.0
        } else {
            self.fragments_reordered as f64 / self.fragments_received as f64
        }
    }

    /// Print a human-readable summary to stdout.
    pub fn print_summary(&self, label: &str) {
        println!("\n=== {} ===", label);
        println!("Datagrams received: {}", self.datagrams_received);
        println!(
            "Records received: {} (discarded {})",
            self.records_received, self.records_discarded
        );
        println!("Fragments received: {}", self.fragments_received);
        println!(
            "Fragments reordered: {} ({:.2}%)",
            self.fragments_reordered,
            self.reorder_rate() * 100.0
        );
        println!(
            "Fragments redundant: {} stale, {} duplicate ({:.2}%)",
            self.fragments_stale,
            self.fragments_duplicate,
            self.redundant_fragment_rate() * 100.0
        );
        println!("Fragments beyond window: {}", self.fragments_beyond_window);
        println!(
            "Messages completed: {} (consumed {})",
            self.messages_completed, self.messages_consumed
        );
        println!();
        println!("Messages enqueued: {}", self.messages_enqueued);
        println!("Flights sent: {}", self.flights_sent);
        println!("Packets sent: {} ({} bytes)", self.packets_sent, self.bytes_sent);
        println!("Retransmissions: {}", self.retransmissions);
        println!("Write blocked: {}", self.write_blocked);
    }

    /// Export metrics as a simple text format (for parsing/testing).
    pub fn export_text(&self) -> String {
        format!(
            "datagrams_received={}\n\
             records_discarded={}\n\
             fragments_received={}\n\
             fragments_reordered={}\n\
             fragments_stale={}\n\
             fragments_duplicate={}\n\
             messages_completed={}\n\
             packets_sent={}\n\
             bytes_sent={}\n\
             retransmissions={}\n\
             write_blocked={}\n",
            self.datagrams_received,
            self.records_discarded,
            self.fragments_received,
            self.fragments_reordered,
            self.fragments_stale,
            self.fragments_duplicate,
            self.messages_completed,
            self.packets_sent,
            self.bytes_sent,
            self.retransmissions,
            self.write_blocked,
        )
    }
}

/// Helper for tracking reordering.
///
/// Tracks, per message sequence number, the furthest body offset seen so far.
#[derive(Debug, Default)]
pub struct ReorderTracker {
    furthest_end: HashMap<u16, usize>,
}

impl ReorderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fragment and return true if it arrived out of order.
    ///
    /// A fragment is reordered if it starts before the end of a fragment
    /// already seen for the same message.
    pub fn track(&mut self, seq: u16, frag_off: usize, frag_end: usize) -> bool {
        let furthest = self.furthest_end.entry(seq).or_insert(0);
        let is_reordered = frag_off < *furthest;
        if frag_end > *furthest {
            *furthest = frag_end;
        }
        is_reordered
    }

    /// Forget a message (when it is consumed).
    pub fn clear_message(&mut self, seq: u16) {
        self.furthest_end.remove(&seq);
    }
}
