//! Gateway entry point: load config, start the push server, stop on ctrl-c.
//!
//! Run with: `cargo run -p pushgate-server -- --port 3000`

use std::sync::Arc;
use std::sync::mpsc;

use clap::Parser;
use pushgate_config::{CliArgs, Config, default_config_dir};
use pushgate_push::{GatewayConfig, PushGateway, TracingListener};
use tracing::{error, info};

fn main() {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(2);
    }

    pushgate_log::init_logging(config.log.json_dir.as_deref(), Some(&config));

    if let Err(e) = run(&config) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let gateway = PushGateway::new(GatewayConfig::from_config(config)?);
    gateway.register_listener(Arc::new(TracingListener), i32::MAX);
    gateway.init()?;

    let (bound_tx, bound_rx) = mpsc::channel();
    gateway.start(move |result| {
        let _ = bound_tx.send(result);
    })?;
    let addr = bound_rx.recv()??;
    info!(
        "Pushgate listening on {addr} (ack timeout {}ms)",
        config.delivery.ack_timeout_ms
    );

    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    signals.block_on(tokio::signal::ctrl_c())?;
    info!("Interrupt received");

    gateway.stop(|result| match result {
        Ok(addr) => info!("Released {addr}"),
        Err(e) => error!("Stop failed: {e}"),
    })?;
    Ok(())
}
