//! dtls-flight-sim: run a DTLS handshake over a simulated lossy link.
//!
//! Both endpoints share a seeded script of message bodies. Every message
//! the peers reassemble is checked against what was sent; the process exits
//! non-zero if the handshake fails or any message differs.

mod config;
mod endpoint;
mod error;
mod script;
mod sim;

use config::Config;
use log::error;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            eprintln!("run with --help for usage");
            return ExitCode::from(2);
        }
    };

    if config.print_config {
        config.print();
    }

    match sim::run(&config) {
        Ok(report) => {
            report.print(config.print_metrics);
            println!("\n✓ Handshake complete (seed {})", config.seed);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("simulation failed: {}", err);
            if let Some(alert) = err.alert() {
                eprintln!("alert: {:?}", alert);
            }
            eprintln!("✗ Handshake failed (seed {}): {}", config.seed, err);
            ExitCode::FAILURE
        }
    }
}
