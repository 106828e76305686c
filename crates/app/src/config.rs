//! Configuration for the dtls-flight-sim application.
//!
//! Handles parsing command-line arguments and generating sensible defaults
//! (including randomized defaults that are reproducible with a seed).
//!
//! # Philosophy
//!
//! The tool should work with ZERO arguments, using intelligent defaults.
//! All defaults are printed so runs are reproducible.

use dtls_flight_core::config::{HandshakeConfig, Role, DEFAULT_MAX_CERT_LIST, DEFAULT_MTU, MIN_MTU};
use dtls_flight_core::network::NetworkConfig;
use dtls_flight_core::timer::MAX_TIMEOUT;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::str::FromStr;
use std::time::Duration;

/// Complete configuration for a simulated handshake.
#[derive(Debug, Clone)]
pub struct Config {
    /// Seed for message bodies and network effects
    pub seed: u64,

    // === Handshake ===
    /// Path MTU in bytes
    pub mtu: usize,

    /// MTU to fall back to after repeated timeouts
    pub fallback_mtu: Option<usize>,

    /// Size of the server's Certificate body
    pub certificate_bytes: usize,

    /// First retransmission timeout in milliseconds
    pub initial_timeout_ms: u64,

    /// Retransmissions before an endpoint gives up
    pub max_timeouts: u32,

    /// Packets each endpoint may send per tick (None = unlimited)
    pub send_budget: Option<usize>,

    // === Network ===
    /// Network simulation config (client -> server; the reverse link reseeds)
    pub network: NetworkConfig,

    /// Virtual time after which the run is abandoned
    pub time_limit_ms: u64,

    // === Behavior ===
    /// Whether to print detailed config
    pub print_config: bool,

    /// Whether to print detailed metrics summary
    pub print_metrics: bool,
}

/// Parse the value following `args[*i]`.
fn flag_value<T: FromStr>(args: &[String], i: &mut usize, what: &str) -> Result<T, String> {
    let flag = &args[*i];
    *i += 1;
    let value = args
        .get(*i)
        .ok_or_else(|| format!("{} requires {}", flag, what))?;
    value
        .parse()
        .map_err(|_| format!("invalid {}: {}", flag.trim_start_matches('-'), value))
}

impl Config {
    /// Parse configuration from command-line arguments.
    ///
    /// If no arguments provided, generates randomized defaults using a time-based seed.
    /// If --seed is provided, uses that seed for all randomness (fully deterministic).
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        let mut seed: Option<u64> = None;
        let mut mtu: Option<usize> = None;
        let mut fallback_mtu: Option<usize> = None;
        let mut certificate_bytes: Option<usize> = None;
        let mut initial_timeout_ms: Option<u64> = None;
        let mut max_timeouts: Option<u32> = None;
        let mut send_budget: Option<Option<usize>> = None;
        let mut base_latency_ms: Option<u64> = None;
        let mut jitter_ms: Option<u64> = None;
        let mut loss_rate: Option<f64> = None;
        let mut duplicate_rate: Option<f64> = None;
        let mut time_limit_ms: Option<u64> = None;
        let mut print_config = false;
        let mut print_metrics = true;

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--seed" => seed = Some(flag_value(args, &mut i, "a number")?),
                "--mtu" => mtu = Some(flag_value(args, &mut i, "a number")?),
                "--fallback-mtu" => fallback_mtu = Some(flag_value(args, &mut i, "a number")?),
                "--cert-bytes" => certificate_bytes = Some(flag_value(args, &mut i, "a number")?),
                "--timeout" => initial_timeout_ms = Some(flag_value(args, &mut i, "milliseconds")?),
                "--max-timeouts" => max_timeouts = Some(flag_value(args, &mut i, "a number")?),
                "--send-budget" => send_budget = Some(Some(flag_value(args, &mut i, "a number")?)),
                "--unlimited-send" => send_budget = Some(None),
                "--latency" => base_latency_ms = Some(flag_value(args, &mut i, "milliseconds")?),
                "--jitter" => jitter_ms = Some(flag_value(args, &mut i, "milliseconds")?),
                "--loss" => loss_rate = Some(flag_value(args, &mut i, "a rate")?),
                "--no-loss" => loss_rate = Some(0.0),
                "--duplicate" => duplicate_rate = Some(flag_value(args, &mut i, "a rate")?),
                "--time-limit" => time_limit_ms = Some(flag_value(args, &mut i, "milliseconds")?),
                "--print-config" => print_config = true,
                "--no-metrics" => print_metrics = false,
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => {
                    return Err(format!("unknown argument: {}", args[i]));
                }
            }
            i += 1;
        }

        // Determine seed (explicit or time-based)
        let seed = seed.unwrap_or_else(|| {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis() as u64)
                .unwrap_or_default()
        });

        // Generate defaults using seed
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let config = Config {
            seed,
            mtu: mtu.unwrap_or(DEFAULT_MTU),
            fallback_mtu,
            certificate_bytes: certificate_bytes.unwrap_or_else(|| rng.gen_range(1500..=8000)),
            initial_timeout_ms: initial_timeout_ms.unwrap_or(1000),
            max_timeouts: max_timeouts.unwrap_or(12),
            send_budget: send_budget.unwrap_or_else(|| Some(rng.gen_range(2..=8))),
            network: NetworkConfig {
                base_latency_ms: base_latency_ms.unwrap_or_else(|| rng.gen_range(10..=80)),
                jitter_ms: jitter_ms.unwrap_or_else(|| rng.gen_range(0..=40)),
                loss_rate: loss_rate.unwrap_or_else(|| {
                    // Bias toward small loss rates
                    let r: f64 = rng.gen();
                    (r * r * 0.1).min(0.1) // 0-10%, biased toward 0
                }),
                duplicate_rate: duplicate_rate.unwrap_or_else(|| rng.gen_range(0.0..=0.03)),
                seed,
            },
            time_limit_ms: time_limit_ms.unwrap_or(600_000),
            print_config,
            print_metrics,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mtu < MIN_MTU {
            return Err(format!("mtu must be at least {}", MIN_MTU));
        }
        if self.fallback_mtu.is_some_and(|fallback| fallback < MIN_MTU) {
            return Err(format!("fallback-mtu must be at least {}", MIN_MTU));
        }
        if self.certificate_bytes > DEFAULT_MAX_CERT_LIST {
            return Err(format!("cert-bytes must be at most {}", DEFAULT_MAX_CERT_LIST));
        }
        if self.initial_timeout_ms == 0 {
            return Err("timeout must be positive".to_string());
        }
        if Duration::from_millis(self.initial_timeout_ms) > MAX_TIMEOUT {
            return Err(format!("timeout must be at most {} ms", MAX_TIMEOUT.as_millis()));
        }
        if self.send_budget == Some(0) {
            return Err("send-budget must be positive".to_string());
        }
        for (name, rate) in [
            ("loss", self.network.loss_rate),
            ("duplicate", self.network.duplicate_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(format!("{} rate must be within 0.0-1.0", name));
            }
        }
        Ok(())
    }

    /// Connection configuration for one side of the handshake.
    pub fn handshake_config(&self, role: Role) -> HandshakeConfig {
        let defaults = match role {
            Role::Client => HandshakeConfig::client(),
            Role::Server => HandshakeConfig::server(),
        };
        HandshakeConfig {
            mtu: self.mtu,
            fallback_mtu: self.fallback_mtu,
            initial_timeout: Duration::from_millis(self.initial_timeout_ms),
            max_timeouts: self.max_timeouts,
            ..defaults
        }
    }

    /// Print the configuration in human-readable form.
    pub fn print(&self) {
        println!("=== Configuration ===");
        println!("Seed: {}", self.seed);
        println!();
        println!("=== Handshake ===");
        println!("MTU: {} bytes", self.mtu);
        match self.fallback_mtu {
            Some(fallback) => println!("Fallback MTU: {} bytes", fallback),
            None => println!("Fallback MTU: (none)"),
        }
        println!("Certificate: {} bytes", self.certificate_bytes);
        println!("Initial timeout: {} ms", self.initial_timeout_ms);
        println!("Max timeouts: {}", self.max_timeouts);
        match self.send_budget {
            Some(budget) => println!("Send budget: {} packets per tick", budget),
            None => println!("Send budget: unlimited"),
        }
        println!();
        println!("=== Network Simulation ===");
        println!("Base latency: {} ms", self.network.base_latency_ms);
        println!("Jitter: ±{} ms", self.network.jitter_ms);
        println!("Loss rate: {:.2}%", self.network.loss_rate * 100.0);
        println!("Duplicate rate: {:.2}%", self.network.duplicate_rate * 100.0);
        println!("Time limit: {} ms", self.time_limit_ms);
        println!();
    }
}

fn print_help() {
    println!("dtls-flight-sim: DTLS handshake over a simulated lossy datagram link");
    println!();
    println!("USAGE:");
    println!("    dtls-flight-sim [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --seed <N>              Random seed for determinism");
    println!();
    println!("    --mtu <N>               Path MTU (default: {})", DEFAULT_MTU);
    println!("    --fallback-mtu <N>      MTU after repeated timeouts (default: none)");
    println!("    --cert-bytes <N>        Certificate size (default: random 1500-8000)");
    println!("    --timeout <MS>          Initial retransmission timeout (default: 1000)");
    println!("    --max-timeouts <N>      Retransmissions before giving up (default: 12)");
    println!("    --send-budget <N>       Packets sent per tick (default: random 2-8)");
    println!("    --unlimited-send        Never block sends");
    println!();
    println!("    --latency <MS>          Base network latency (default: random 10-80)");
    println!("    --jitter <MS>           Latency jitter (default: random 0-40)");
    println!("    --loss <RATE>           Datagram loss rate 0.0-1.0 (default: random 0-0.1)");
    println!("    --no-loss               Disable datagram loss (same as --loss 0)");
    println!("    --duplicate <RATE>      Datagram duplication rate (default: random 0-0.03)");
    println!("    --time-limit <MS>       Abandon the run after this much virtual time");
    println!();
    println!("    --print-config          Print resolved configuration");
    println!("    --no-metrics            Don't print metrics summary");
    println!("    --help, -h              Print this help");
    println!();
    println!("EXAMPLES:");
    println!("    dtls-flight-sim                              # Run with random defaults");
    println!("    dtls-flight-sim --seed 42                    # Deterministic run");
    println!("    dtls-flight-sim --loss 0.3 --fallback-mtu 576");
    println!("    dtls-flight-sim --no-loss --latency 10       # Perfect network, 10ms delay");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_seeded_defaults_are_deterministic() {
        let a = Config::from_args(&args(&["--seed", "42"])).unwrap();
        let b = Config::from_args(&args(&["--seed", "42"])).unwrap();
        assert_eq!(a.certificate_bytes, b.certificate_bytes);
        assert_eq!(a.network.base_latency_ms, b.network.base_latency_ms);
        assert_eq!(a.send_budget, b.send_budget);
        assert!(a.network.loss_rate <= 0.1);
    }

    #[test]
    fn test_explicit_flags() {
        let config = Config::from_args(&args(&[
            "--seed", "1", "--mtu", "600", "--fallback-mtu", "300", "--no-loss",
            "--unlimited-send", "--cert-bytes", "9000", "--print-config",
        ]))
        .unwrap();
        assert_eq!(config.mtu, 600);
        assert_eq!(config.fallback_mtu, Some(300));
        assert_eq!(config.network.loss_rate, 0.0);
        assert_eq!(config.send_budget, None);
        assert_eq!(config.certificate_bytes, 9000);
        assert!(config.print_config);

        let server = config.handshake_config(Role::Server);
        assert_eq!(server.role, Role::Server);
        assert_eq!(server.mtu, 600);
    }

    #[test]
    fn test_timeout_ceiling_accepted() {
        let config = Config::from_args(&args(&["--seed", "3", "--timeout", "60000"])).unwrap();
        let client = config.handshake_config(Role::Client);
        assert_eq!(client.initial_timeout, MAX_TIMEOUT);
        assert!(client.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Config::from_args(&args(&["--mtu"])).is_err());
        assert!(Config::from_args(&args(&["--mtu", "abc"])).is_err());
        assert!(Config::from_args(&args(&["--mtu", "100"])).is_err());
        assert!(Config::from_args(&args(&["--loss", "1.5"])).is_err());
        assert!(Config::from_args(&args(&["--send-budget", "0"])).is_err());
        assert!(Config::from_args(&args(&["--timeout", "60001"])).is_err());
        assert!(Config::from_args(&args(&["--timeout", "18446744073709551615"])).is_err());
        assert!(Config::from_args(&args(&["--bogus"])).is_err());
    }
}
