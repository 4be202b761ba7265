//! Configuration system for the Pushgate delivery core.
//!
//! Provides runtime-configurable settings that persist to disk as RON files.
//! Supports CLI overrides via clap, hot-reload detection, and forward/backward
//! compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CodecSettings, Config, DeliverySettings, LogSettings, ServerSettings, TransportBackend,
    default_config_dir,
};
pub use error::ConfigError;
