mod logging;

pub use logging::{SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "knock_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit stdout logs as JSON lines instead of human-readable text.
    pub json: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            log_to_sqlite: false,
            log_db_path: dirs_fallback().join("knock-logs.db"),
        }
    }
}

fn env_filter(config: &TelemetryConfig) -> EnvFilter {
    let mut filter_str = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str))
}

/// Initialize the telemetry subsystem. Call once at startup; later calls keep
/// the first subscriber. Returns whether warn+ events are being persisted.
pub fn init_telemetry(config: TelemetryConfig) -> bool {
    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter(&config))
    });
    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter(&config))
    });

    let sqlite_layer = if config.log_to_sqlite {
        match SqliteLogSink::open(&config.log_db_path) {
            Ok(sink) => Some(SqliteLogLayer::new(Arc::new(sink))),
            Err(e) => {
                eprintln!("knock-telemetry: failed to open log DB: {e}");
                None
            }
        }
    } else {
        None
    };
    let persisting = sqlite_layer.is_some();

    let installed = tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(sqlite_layer)
        .try_init();
    if let Err(e) = installed {
        eprintln!("knock-telemetry: subscriber already set: {e}");
    }

    persisting
}

/// Fallback home dir for default paths.
fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".knock")
}
