//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`KnockSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `KNOCK_*` environment variable overrides
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::KnockSettings;

/// `~/.knock`, or `/tmp/.knock` when HOME is unset.
pub fn knock_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".knock")
}

/// Resolve the path to the settings file (`~/.knock/settings.json`).
pub fn settings_path() -> PathBuf {
    knock_dir().join("settings.json")
}

/// Absolute paths pass through; relative ones land under [`knock_dir`].
pub fn resolve_path(path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        knock_dir().join(path)
    }
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<KnockSettings> {
    let defaults = serde_json::to_value(KnockSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: KnockSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `KNOCK_*` environment overrides. Invalid values are logged and
/// ignored.
pub fn apply_env_overrides(settings: &mut KnockSettings) {
    if let Some(v) = read_env_string("KNOCK_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("KNOCK_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_u64("KNOCK_HEARTBEAT_INTERVAL", 1, 3600) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = read_env_u64("KNOCK_HEARTBEAT_TIMEOUT", 1, 86_400) {
        settings.server.heartbeat_timeout_secs = v;
    }
    if let Some(v) = read_env_bool("KNOCK_NOTIFY_DENIED") {
        settings.relay.notify_denied = v;
    }
    if let Some(v) = read_env_string("KNOCK_DB_PATH") {
        settings.store.db_path = v;
    }
    if let Some(v) = read_env_string("KNOCK_LOG_LEVEL") {
        if parse_level(&v).is_some() {
            settings.logging.level = v.to_lowercase();
        } else {
            tracing::warn!(key = "KNOCK_LOG_LEVEL", value = %v, "invalid log level env var, ignoring");
        }
    }
    if let Some(v) = read_env_bool("KNOCK_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Reject combinations the server cannot run with.
pub fn validate(settings: &KnockSettings) -> Result<()> {
    let server = &settings.server;
    if server.heartbeat_interval_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "server.heartbeat_interval_secs must be positive".into(),
        ));
    }
    if server.heartbeat_timeout_secs < server.heartbeat_interval_secs {
        return Err(SettingsError::InvalidValue(format!(
            "server.heartbeat_timeout_secs ({}) is shorter than the interval ({})",
            server.heartbeat_timeout_secs, server.heartbeat_interval_secs
        )));
    }
    if server.max_send_queue == 0 {
        return Err(SettingsError::InvalidValue(
            "server.max_send_queue must be positive".into(),
        ));
    }
    if parse_level(&settings.logging.level).is_none() {
        return Err(SettingsError::InvalidValue(format!(
            "unknown logging.level {:?}",
            settings.logging.level
        )));
    }
    Ok(())
}

/// Parse a level name as understood by `tracing`.
pub fn parse_level(val: &str) -> Option<tracing::Level> {
    val.parse().ok()
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "0.0.0.0"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_and_primitive_replace() {
        let target = serde_json::json!({"items": [1, 2, 3], "a": {"nested": true}});
        let source = serde_json::json!({"items": [4], "a": 42});
        let merged = deep_merge(target, source);
        assert_eq!(merged["items"], serde_json::json!([4]));
        assert_eq!(merged["a"], 42);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.heartbeat_timeout_secs, 60);
        assert!(!settings.relay.notify_denied);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"relay": {"notify_denied": true}, "store": {"db_path": "/data/relay.db"}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert!(settings.relay.notify_denied);
        assert_eq!(settings.store.db_path, "/data/relay.db");
        assert_eq!(settings.server.max_send_queue, 256);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn load_rejects_timeout_shorter_than_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"heartbeat_interval_secs": 30, "heartbeat_timeout_secs": 10}}"#,
        )
        .unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn validate_rejects_unknown_level() {
        let mut settings = KnockSettings::default();
        settings.logging.level = "loud".into();
        assert!(validate(&settings).is_err());
        settings.logging.level = "debug".into();
        assert!(validate(&settings).is_ok());
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in ["false", "0", "no", "Off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("0", 0, 65535), Some(0));
        assert_eq!(parse_u16_range("99999", 0, 65535), None);
        assert_eq!(parse_u64_range("30", 1, 3600), Some(30));
        assert_eq!(parse_u64_range("0", 1, 3600), None);
        assert_eq!(parse_u64_range("abc", 1, 3600), None);
    }

    #[test]
    fn parse_level_names() {
        assert_eq!(parse_level("warn"), Some(tracing::Level::WARN));
        assert_eq!(parse_level("TRACE"), Some(tracing::Level::TRACE));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn relative_paths_resolve_under_knock_dir() {
        assert!(resolve_path("knock.db").ends_with(".knock/knock.db"));
        assert_eq!(resolve_path("/tmp/x.db"), PathBuf::from("/tmp/x.db"));
    }
}
