//! Structured logging for the Pushgate delivery core.
//!
//! Console output carries uptime timestamps, module paths and thread names so
//! acceptor and worker contexts can be told apart. An optional JSON file layer
//! records the same events for post-mortem analysis.

use std::path::Path;

use pushgate_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config specify one.
pub const DEFAULT_FILTER: &str = "info";

/// Initialize the tracing subscriber.
///
/// * `json_dir` - directory for `pushgate.log` (JSON lines). `None` disables it.
/// * `config` - optional configuration whose `log.level` is used as the filter.
///
/// `RUST_LOG` always takes precedence over the configured level.
///
/// ```no_run
/// use pushgate_log::init_logging;
/// use pushgate_config::Config;
///
/// let config = Config::default();
/// init_logging(config.log.json_dir.as_deref(), Some(&config));
/// ```
pub fn init_logging(json_dir: Option<&Path>, config: Option<&Config>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true) // pushgate-boss / pushgate-worker-N
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if let Some(json_dir) = json_dir
        && std::fs::create_dir_all(json_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(json_dir.join("pushgate.log"))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

/// Filter directive derived from the config, falling back to [`DEFAULT_FILTER`].
pub fn filter_directive(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.log.level.trim().is_empty() => config.log.level.clone(),
        _ => DEFAULT_FILTER.to_string(),
    }
}
