//! Command-line argument parsing for the gateway binary.

use std::path::PathBuf;

use clap::Parser;

use crate::{Config, TransportBackend};

/// Pushgate command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "pushgate", about = "Push notification delivery gateway")]
pub struct CliArgs {
    /// Host to bind.
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind.
    #[arg(long)]
    pub port: Option<u16>,

    /// Transport backend.
    #[arg(long, value_enum)]
    pub transport: Option<TransportBackend>,

    /// Worker context count (0 = one per CPU core).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Acknowledgment timeout in milliseconds.
    #[arg(long)]
    pub ack_timeout_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref host) = args.host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(transport) = args.transport {
            self.server.transport = transport;
        }
        if let Some(workers) = args.workers {
            self.server.worker_threads = workers;
        }
        if let Some(ms) = args.ack_timeout_ms {
            self.delivery.ack_timeout_ms = ms;
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            port: Some(7000),
            transport: Some(TransportBackend::Portable),
            ack_timeout_ms: Some(5_000),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.transport, TransportBackend::Portable);
        assert_eq!(config.delivery.ack_timeout_ms, 5_000);
        // Non-overridden fields retain defaults
        assert_eq!(config.server.boss_threads, 1);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_zero_ack_timeout_override_fails_validation() {
        let mut config = Config::default();
        let args = CliArgs::parse_from(["pushgate", "--ack-timeout-ms", "0"]);
        config.apply_cli_overrides(&args);
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid delivery.ack_timeout_ms: must be at least 1"
        );
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from([
            "pushgate",
            "--port",
            "9000",
            "--transport",
            "native",
            "--workers",
            "4",
        ]);
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.transport, Some(TransportBackend::Native));
        assert_eq!(args.workers, Some(4));
        assert!(args.host.is_none());
    }
}
