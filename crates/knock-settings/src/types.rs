//! Settings sections. Every field has a compiled default, so a settings file
//! only needs the keys it changes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root settings object, mirrored by `~/.knock/settings.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnockSettings {
    pub server: ServerSettings,
    pub relay: RelaySettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

/// Listener and per-connection limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. 0 picks an ephemeral port.
    pub port: u16,
    /// Outbound frames buffered per connection before new ones are dropped.
    pub max_send_queue: usize,
    /// Seconds between pings.
    pub heartbeat_interval_secs: u64,
    /// Seconds without a pong before the connection is closed.
    pub heartbeat_timeout_secs: u64,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Answer unapproved guest messages with `permissionDenied` instead of
    /// dropping them silently.
    pub notify_denied: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Database file. Relative paths resolve against `~/.knock`.
    pub db_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: "knock.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` still wins.
    pub level: String,
    /// JSON lines on stdout.
    pub json: bool,
    /// Persist warn+ events to SQLite.
    pub log_to_sqlite: bool,
    /// Log database file. Relative paths resolve against `~/.knock`.
    pub log_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_to_sqlite: false,
            log_db_path: "knock-logs.db".to_string(),
        }
    }
}

impl KnockSettings {
    /// Resolved database path.
    pub fn db_path(&self) -> PathBuf {
        crate::loader::resolve_path(&self.store.db_path)
    }

    /// Resolved log database path.
    pub fn log_db_path(&self) -> PathBuf {
        crate::loader::resolve_path(&self.logging.log_db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_serialize_with_every_section() {
        let value = serde_json::to_value(KnockSettings::default()).unwrap();
        assert_eq!(value["server"]["port"], 8080);
        assert_eq!(value["server"]["heartbeat_interval_secs"], 30);
        assert_eq!(value["relay"]["notify_denied"], false);
        assert_eq!(value["store"]["db_path"], "knock.db");
        assert_eq!(value["logging"]["level"], "info");
    }

    #[test]
    fn partial_section_fills_defaults() {
        let settings: KnockSettings =
            serde_json::from_str(r#"{"server": {"port": 9000}}"#).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.relay, RelaySettings::default());
    }

    #[test]
    fn absolute_db_path_is_kept() {
        let mut settings = KnockSettings::default();
        settings.store.db_path = "/var/lib/knock/relay.db".into();
        assert_eq!(settings.db_path(), PathBuf::from("/var/lib/knock/relay.db"));
        assert!(KnockSettings::default().db_path().ends_with(".knock/knock.db"));
    }
}
