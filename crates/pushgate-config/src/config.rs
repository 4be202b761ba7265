//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener and execution-context settings.
    pub server: ServerSettings,
    /// Delivery tracking settings.
    pub delivery: DeliverySettings,
    /// Wire codec settings.
    pub codec: CodecSettings,
    /// Logging settings.
    pub log: LogSettings,
}

/// I/O multiplexing backend used by the acceptor and workers.
///
/// Both backends behave identically; they differ only in how the listening
/// socket is built and tuned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum TransportBackend {
    /// Plain listener with the platform's default socket options.
    Portable,
    /// Hand-built listener with address/port reuse and a deeper backlog.
    Native,
}

impl Default for TransportBackend {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Self::Native
        } else {
            Self::Portable
        }
    }
}

/// Listener and execution-context configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Host to bind. Empty binds every interface.
    pub host: String,
    /// Port to bind. 0 picks an ephemeral port.
    pub port: u16,
    /// Transport backend.
    pub transport: TransportBackend,
    /// Threads driving the accept loop.
    pub boss_threads: usize,
    /// Worker contexts (0 = one per CPU core).
    pub worker_threads: usize,
    /// Percentage of loop time favouring I/O polling over queued tasks (1-100).
    pub io_ratio: u8,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Seconds without inbound traffic before a connection is closed.
    pub idle_timeout_secs: u64,
    /// Frames queued per connection before further pushes fail.
    pub outbound_queue: usize,
}

/// Delivery tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeliverySettings {
    /// How long to wait for an acknowledgment, in milliseconds.
    pub ack_timeout_ms: u64,
}

/// Wire codec configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CodecSettings {
    /// Largest accepted frame (header + payload) in bytes.
    pub max_frame_size: u32,
    /// Compress large data payloads with LZ4.
    pub compression_enabled: bool,
    /// Minimum payload size in bytes before compression applies.
    pub compression_threshold: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    /// Log level filter (e.g., "debug", "info", "pushgate_net=trace").
    pub level: String,
    /// Directory for JSON log files. `None` disables file logging.
    pub json_dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 3000,
            transport: TransportBackend::default(),
            boss_threads: 1,
            worker_threads: 0,
            io_ratio: 70,
            max_connections: 100_000,
            idle_timeout_secs: 180,
            outbound_queue: 1024,
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 3_000,
        }
    }
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            compression_enabled: true,
            compression_threshold: 1024,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_dir: None,
        }
    }
}

/// Platform config directory for the gateway (`~/.config/pushgate` on Linux).
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pushgate")
}

// --- Load / Save / Reload ---

impl Config {
    /// Load and validate config from the given directory, or create a default
    /// config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let config_path = config_dir.join("config.ron");
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_path.clone(),
            source,
        })?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let serialized = ron::ser::to_string_pretty(self, pretty)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::Write {
            path: config_path,
            source,
        })
    }

    /// Re-read `config.ron`: `Some(new_config)` if it changed, `None` otherwise.
    /// A file that no longer validates is an error and the current config stays.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join("config.ron"))?;
        new_config.validate()?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Check every setting the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        if !(1..=100).contains(&self.server.io_ratio) {
            return invalid("server.io_ratio", "must be between 1 and 100");
        }
        if self.server.max_connections == 0 {
            return invalid("server.max_connections", "must be at least 1");
        }
        if self.server.idle_timeout_secs == 0 {
            return invalid("server.idle_timeout_secs", "must be at least 1");
        }
        if self.server.outbound_queue == 0 {
            return invalid("server.outbound_queue", "must be at least 1");
        }
        if self.delivery.ack_timeout_ms == 0 {
            return invalid("delivery.ack_timeout_ms", "must be at least 1");
        }
        // Header alone is 11 bytes after the length prefix.
        if self.codec.max_frame_size < 16 {
            return invalid("codec.max_frame_size", "must be at least 16 bytes");
        }
        Ok(())
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        ron::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
