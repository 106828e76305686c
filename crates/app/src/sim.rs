//! Virtual-time driver for a simulated handshake.
//!
//! Two endpoints exchange datagrams over two one-way [`NetworkSimulator`]
//! links. The clock jumps straight to the next event (a delivery, a
//! retransmission deadline, or a tick to resume a blocked flight), so a
//! handshake that takes minutes of retransmission timeouts runs instantly.

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::SimError;
use crate::script::HandshakeScript;
use dtls_flight_core::config::Role;
use dtls_flight_core::metrics::Metrics;
use dtls_flight_core::network::{NetworkConfig, NetworkSimulator, NetworkStats};
use log::{debug, trace};
use std::time::{Duration, Instant};

/// Maps virtual milliseconds onto `Instant`s for the connections.
#[derive(Debug, Clone, Copy)]
struct VirtualClock {
    base: Instant,
}

impl VirtualClock {
    fn new() -> Self {
        Self {
            base: Instant::now(),
        }
    }

    fn at(&self, ms: u64) -> Instant {
        self.base + Duration::from_millis(ms)
    }

    /// Virtual time of `instant`, rounded up to the next millisecond.
    fn ms(&self, instant: Instant) -> u64 {
        let nanos = instant.saturating_duration_since(self.base).as_nanos();
        nanos.div_ceil(1_000_000) as u64
    }
}

/// Outcome of a completed handshake.
#[derive(Debug, Clone)]
pub struct Report {
    /// Virtual time the handshake took
    pub elapsed_ms: u64,

    /// Clock advances
    pub rounds: u64,

    /// Handshake body bytes in both directions
    pub handshake_bytes: usize,

    /// Messages checked against the script, both sides
    pub messages_verified: usize,

    pub client: Metrics,
    pub server: Metrics,
    pub to_server: NetworkStats,
    pub to_client: NetworkStats,
}

impl Report {
    pub fn print(&self, print_metrics: bool) {
        println!("=== Handshake ===");
        println!("Completed in {} ms of virtual time ({} rounds)", self.elapsed_ms, self.rounds);
        println!(
            "Messages verified: {} ({} body bytes)",
            self.messages_verified, self.handshake_bytes
        );
        println!(
            "Retransmissions: client {}, server {}",
            self.client.retransmissions, self.server.retransmissions
        );

        if !print_metrics {
            return;
        }

        print_link("client -> server", &self.to_server);
        print_link("server -> client", &self.to_client);
        self.client.print_summary("Client");
        self.server.print_summary("Server");
    }
}

fn print_link(label: &str, stats: &NetworkStats) {
    println!("\n=== Link {} ===", label);
    println!("Datagrams sent: {}", stats.datagrams_sent);
    println!(
        "Dropped: {} ({:.2}%)",
        stats.datagrams_dropped,
        stats.loss_rate() * 100.0
    );
    println!("Duplicated: {}", stats.datagrams_duplicated);
    println!("Delivered: {}", stats.datagrams_delivered);
}

/// Run one full handshake as described by `config`.
pub fn run(config: &Config) -> Result<Report, SimError> {
    let script = HandshakeScript::generate(config.seed, config.certificate_bytes);

    let mut client = Endpoint::new(
        "client",
        config.handshake_config(Role::Client),
        script.client_actions(),
        config.send_budget,
    )?;
    let mut server = Endpoint::new(
        "server",
        config.handshake_config(Role::Server),
        script.server_actions(),
        config.send_budget,
    )?;

    let mut to_server = NetworkSimulator::new(config.network);
    let mut to_client = NetworkSimulator::new(NetworkConfig {
        seed: config.network.seed.wrapping_add(1),
        ..config.network
    });

    let clock = VirtualClock::new();
    let mut now_ms = 0;
    let mut rounds = 0;

    client.step(clock.at(now_ms))?;
    server.step(clock.at(now_ms))?;

    loop {
        for datagram in client.take_outgoing() {
            to_server.send(datagram, now_ms);
        }
        for datagram in server.take_outgoing() {
            to_client.send(datagram, now_ms);
        }

        if client.is_finished() && server.is_finished() {
            break;
        }

        let Some(next_ms) = next_event_ms(&clock, now_ms, &client, &server, &to_server, &to_client)
        else {
            return Err(SimError::Stalled { at_ms: now_ms });
        };
        if next_ms > config.time_limit_ms {
            return Err(SimError::TimeLimit {
                limit_ms: config.time_limit_ms,
            });
        }
        now_ms = next_ms.max(now_ms);
        rounds += 1;
        trace!("t={} ms", now_ms);

        let now = clock.at(now_ms);
        while let Some(datagram) = to_server.recv(now_ms) {
            server.on_datagram(&datagram, now)?;
        }
        while let Some(datagram) = to_client.recv(now_ms) {
            client.on_datagram(&datagram, now)?;
        }
        client.on_tick(now)?;
        server.on_tick(now)?;
    }

    debug!(
        "handshake finished at {} ms; client sent {} transcript bytes, server {}",
        now_ms,
        client.transcript_len(),
        server.transcript_len()
    );

    Ok(Report {
        elapsed_ms: now_ms,
        rounds,
        handshake_bytes: script.total_bytes(),
        messages_verified: client.messages_verified() + server.messages_verified(),
        client: client.metrics().clone(),
        server: server.metrics().clone(),
        to_server: to_server.stats(),
        to_client: to_client.stats(),
    })
}

/// The earliest pending event, if anything can still happen.
fn next_event_ms(
    clock: &VirtualClock,
    now_ms: u64,
    client: &Endpoint,
    server: &Endpoint,
    to_server: &NetworkSimulator,
    to_client: &NetworkSimulator,
) -> Option<u64> {
    let next = [
        to_server.next_delivery_ms(),
        to_client.next_delivery_ms(),
        client.next_timeout().map(|deadline| clock.ms(deadline)),
        server.next_timeout().map(|deadline| clock.ms(deadline)),
    ]
    .into_iter()
    .flatten()
    .min();

    // A blocked flight retries on the next tick.
    if client.has_unsent() || server.has_unsent() {
        let tick = now_ms + 1;
        return Some(next.map_or(tick, |next| next.min(tick)));
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(seed: u64) -> Config {
        let mut config = Config::from_args(&["--seed".to_string(), seed.to_string()]).unwrap();
        config.print_config = false;
        config
    }

    #[test]
    fn test_perfect_network() {
        let mut config = config(1);
        config.network = NetworkConfig::perfect(1);
        config.send_budget = None;

        let report = run(&config).unwrap();
        assert_eq!(report.elapsed_ms, 0);
        assert_eq!(report.messages_verified, 8);
        assert_eq!(report.client.retransmissions, 0);
        assert_eq!(report.server.retransmissions, 0);
    }

    #[test]
    fn test_lossy_networks_complete() {
        for seed in 0..20 {
            let mut config = config(seed);
            config.network.loss_rate = 0.1;
            config.network.duplicate_rate = 0.1;
            config.network.jitter_ms = 40;

            let report = run(&config).unwrap_or_else(|err| panic!("seed {}: {}", seed, err));
            assert_eq!(report.messages_verified, 8);
        }
    }

    #[test]
    fn test_total_loss_times_out() {
        let mut config = config(3);
        config.network.loss_rate = 1.0;
        config.max_timeouts = 3;

        let err = run(&config).unwrap_err();
        assert!(matches!(
            err,
            SimError::Connection {
                endpoint: "client",
                source: dtls_flight_core::Error::TimedOut { .. }
            }
        ));
    }

    #[test]
    fn test_virtual_clock_rounds_up() {
        let clock = VirtualClock::new();
        assert_eq!(clock.ms(clock.at(1500)), 1500);
        assert_eq!(clock.ms(clock.base + Duration::from_micros(1)), 1);
        assert_eq!(clock.ms(clock.base), 0);
    }
}
