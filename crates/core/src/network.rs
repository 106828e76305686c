//! Datagram network simulator with latency, jitter, loss, and duplication.
//!
//! This module simulates an unreliable datagram link in a deterministic way
//! using seeded randomness and a virtual clock. All network effects are
//! reproducible given the same seed and the same sequence of calls.
//!
//! # Simulated Effects
//!
//! - **Latency**: Base delay for all datagrams
//! - **Jitter**: Random variation in latency (uniform), which reorders
//! - **Loss**: Random datagram drops (Bernoulli distribution)
//! - **Duplication**: Random extra copies with independent delays
//!
//! # Implementation
//!
//! Uses a priority queue (min-heap) keyed by delivery time. Time is a
//! caller-supplied millisecond counter, so a whole handshake can be simulated
//! without sleeping.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BinaryHeap;

/// Configuration for network simulation.
#[derive(Debug, Clone, Copy)]
pub struct NetworkConfig {
    /// Base latency in milliseconds
    pub base_latency_ms: u64,

    /// Jitter range in milliseconds (uniform ±jitter)
    pub jitter_ms: u64,

    /// Datagram loss probability [0.0, 1.0]
    pub loss_rate: f64,

    /// Probability that a delivered datagram arrives twice [0.0, 1.0]
    pub duplicate_rate: f64,

    /// Random seed for determinism
    pub seed: u64,
}

impl NetworkConfig {
    /// Create a configuration with no impairments (perfect network).
    pub fn perfect(seed: u64) -> Self {
        Self {
            base_latency_ms: 0,
            jitter_ms: 0,
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            seed,
        }
    }

    /// Create a default configuration with moderate impairments.
    pub fn default_with_seed(seed: u64) -> Self {
        Self {
            base_latency_ms: 50,
            jitter_ms: 20,
            loss_rate: 0.05,
            duplicate_rate: 0.02,
            seed,
        }
    }
}

/// A datagram with scheduled delivery time.
#[derive(Debug, Clone)]
struct ScheduledDatagram {
    datagram: Vec<u8>,
    deliver_at_ms: u64,

    /// Send order, to keep equal delivery times FIFO
    order: u64,
}

impl PartialEq for ScheduledDatagram {
    fn eq(&self, other: &Self) -> bool {
        self.deliver_at_ms == other.deliver_at_ms && self.order == other.order
    }
}

impl Eq for ScheduledDatagram {}

impl PartialOrd for ScheduledDatagram {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledDatagram {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earlier time = higher priority)
        other
            .deliver_at_ms
            .cmp(&self.deliver_at_ms)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// One-directional lossy datagram link.
///
/// # Thread Safety
/// Not thread-safe; use one instance per direction and thread.
pub struct NetworkSimulator {
    config: NetworkConfig,
    rng: ChaCha8Rng,
    queue: BinaryHeap<ScheduledDatagram>,
    next_order: u64,

    // Statistics
    datagrams_sent: u64,
    datagrams_dropped: u64,
    datagrams_duplicated: u64,
    datagrams_delivered: u64,
}

impl NetworkSimulator {
    /// Create a new network simulator with the given configuration.
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            queue: BinaryHeap::new(),
            next_order: 0,
            datagrams_sent: 0,
            datagrams_dropped: 0,
            datagrams_duplicated: 0,
            datagrams_delivered: 0,
        }
    }

    /// Send a datagram at virtual time `now_ms`.
    ///
    /// The datagram may be:
    /// - Dropped (if loss_rate > 0)
    /// - Delayed by latency + jitter
    /// - Duplicated (if duplicate_rate > 0)
    pub fn send(&mut self, datagram: Vec<u8>, now_ms: u64) {
        self.datagrams_sent += 1;

        if self.config.loss_rate > 0.0 && self.rng.gen_bool(self.config.loss_rate.min(1.0)) {
            self.datagrams_dropped += 1;
            return;
        }

        if self.config.duplicate_rate > 0.0
            && self.rng.gen_bool(self.config.duplicate_rate.min(1.0))
        {
            self.datagrams_duplicated += 1;
            self.schedule(datagram.clone(), now_ms);
        }
        self.schedule(datagram, now_ms);
    }

    fn schedule(&mut self, datagram: Vec<u8>, now_ms: u64) {
        let deliver_at_ms = now_ms + self.compute_delay();
        self.queue.push(ScheduledDatagram {
            datagram,
            deliver_at_ms,
            order: self.next_order,
        });
        self.next_order += 1;
    }

    /// Take the next datagram due at or before `now_ms`.
    pub fn recv(&mut self, now_ms: u64) -> Option<Vec<u8>> {
        if self.queue.peek()?.deliver_at_ms > now_ms {
            return None;
        }
        let scheduled = self.queue.pop()?;
        self.datagrams_delivered += 1;
        Some(scheduled.datagram)
    }

    /// Virtual time of the next delivery, if any datagram is in flight.
    pub fn next_delivery_ms(&self) -> Option<u64> {
        self.queue.peek().map(|scheduled| scheduled.deliver_at_ms)
    }

    /// Check if any datagrams are currently in flight (queued).
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Get count of datagrams currently in flight.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Drain all remaining datagrams in delivery order, ignoring delivery times.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        while let Some(scheduled) = self.queue.pop() {
            datagrams.push(scheduled.datagram);
            self.datagrams_delivered += 1;
        }
        datagrams
    }

    /// Get statistics about network behavior.
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            datagrams_sent: self.datagrams_sent,
            datagrams_dropped: self.datagrams_dropped,
            datagrams_duplicated: self.datagrams_duplicated,
            datagrams_delivered: self.datagrams_delivered,
            datagrams_in_flight: self.queue.len(),
        }
    }

    /// Compute delay for a datagram in milliseconds.
    ///
    /// Delay = base_latency ± jitter
    fn compute_delay(&mut self) -> u64 {
        let base = self.config.base_latency_ms;

        if self.config.jitter_ms == 0 {
            return base;
        }

        let jitter_range = self.config.jitter_ms * 2;
        let jitter = self.rng.gen_range(0..=jitter_range);
        let jitter_offset = jitter as i64 - self.config.jitter_ms as i64;

        (base as i64 + jitter_offset).max(0) as u64
    }
}

/// Statistics about network simulator behavior.
#[derive(Debug, Clone, Copy)]
pub struct NetworkStats {
    /// Total datagrams sent into the simulator
    pub datagrams_sent: u64,

    /// Datagrams dropped due to loss
    pub datagrams_dropped: u64,

    /// Extra copies injected
    pub datagrams_duplicated: u64,

    /// Datagrams handed to the receiver
    pub datagrams_delivered: u64,

    /// Datagrams currently in flight
    pub datagrams_in_flight: usize,
}

impl NetworkStats {
    /// Compute datagram loss rate.
    pub fn loss_rate(&self) -> f64 {
        if self.datagrams_sent == 0 {
            0.0
        } else {
            self.datagrams_dropped as f64 / self.datagrams_sent as f64
        }
    }
}
