//! # knock
//!
//! Signaling relay binary. Loads settings, starts logging, opens the store
//! and serves the relay until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use knock_server::{KnockServer, Relay, RelayOptions, ServerConfig};
use knock_settings::KnockSettings;
use knock_store::{Database, KvStore, MemoryKv, SqliteKv};
use knock_telemetry::TelemetryConfig;

/// How long in-flight sessions get to close after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "knock", about = "Host/guest WebSocket signaling relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server.
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Settings file (defaults to `~/.knock/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` database.
    #[arg(long, conflicts_with = "in_memory")]
    db: Option<PathBuf>,

    /// Keep all state in memory; nothing survives a restart.
    #[arg(long)]
    in_memory: bool,
}

impl ServeArgs {
    fn load_settings(&self) -> Result<KnockSettings> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(knock_settings::settings_path);
        let mut settings = knock_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ref db) = self.db {
            // A relative flag means the working directory, not the knock dir.
            let db = std::path::absolute(db)
                .with_context(|| format!("Failed to resolve {}", db.display()))?;
            settings.store.db_path = db.to_string_lossy().into_owned();
        }
        Ok(settings)
    }
}

fn telemetry_config(settings: &KnockSettings) -> Result<TelemetryConfig> {
    let Some(log_level) = knock_settings::parse_level(&settings.logging.level) else {
        bail!("invalid log level {:?}", settings.logging.level);
    };
    Ok(TelemetryConfig {
        log_level,
        json: settings.logging.json,
        log_to_sqlite: settings.logging.log_to_sqlite,
        log_db_path: settings.log_db_path(),
        ..TelemetryConfig::default()
    })
}

fn server_config(settings: &KnockSettings) -> ServerConfig {
    let s = &settings.server;
    ServerConfig {
        host: s.host.clone(),
        port: s.port,
        max_send_queue: s.max_send_queue,
        heartbeat_interval_secs: s.heartbeat_interval_secs,
        heartbeat_timeout_secs: s.heartbeat_timeout_secs,
        max_message_size: s.max_message_size,
    }
}

fn open_store(settings: &KnockSettings, in_memory: bool) -> Result<Arc<dyn KvStore>> {
    if in_memory {
        tracing::warn!("running with in-memory store; state is lost on exit");
        return Ok(Arc::new(MemoryKv::new()));
    }
    let path = settings.db_path();
    let db = Database::open(&path)
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    tracing::info!(path = %path.display(), "store opened");
    Ok(Arc::new(SqliteKv::new(db)))
}

async fn serve(args: ServeArgs) -> Result<()> {
    let settings = args.load_settings()?;
    if knock_telemetry::init_telemetry(telemetry_config(&settings)?) {
        tracing::info!(path = %settings.log_db_path().display(), "persisting warnings");
    }

    let kv = open_store(&settings, args.in_memory)?;
    let relay = Arc::new(Relay::new(
        kv,
        RelayOptions {
            notify_denied: settings.relay.notify_denied,
        },
    ));
    let server = KnockServer::new(server_config(&settings), relay);

    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind listener")?;
    tracing::info!("knock relay ready on ws://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    server
        .shutdown()
        .graceful_shutdown(vec![handle], Some(SHUTDOWN_GRACE))
        .await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServeArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        let Command::Serve(serve) = cli.command;
        serve
    }

    #[test]
    fn cli_flags_override_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 9000, "host": "10.0.0.1"}}"#).unwrap();

        let args = parse(&[
            "knock",
            "serve",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "7000",
            "--db",
            "/tmp/relay.db",
        ]);
        let settings = args.load_settings().unwrap();
        assert_eq!(settings.server.port, 7000);
        assert_eq!(settings.server.host, "10.0.0.1");
        assert_eq!(settings.db_path(), PathBuf::from("/tmp/relay.db"));
    }

    #[test]
    fn relative_db_flag_is_resolved_against_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let args = parse(&[
            "knock",
            "serve",
            "--config",
            path.to_str().unwrap(),
            "--db",
            "relay.db",
        ]);
        let settings = args.load_settings().unwrap();
        assert_eq!(
            settings.db_path(),
            std::env::current_dir().unwrap().join("relay.db")
        );
    }

    #[test]
    fn db_and_in_memory_conflict() {
        assert!(Cli::try_parse_from(["knock", "serve", "--db", "x.db", "--in-memory"]).is_err());
    }

    #[test]
    fn server_config_mirrors_settings() {
        let mut settings = KnockSettings::default();
        settings.server.heartbeat_interval_secs = 5;
        let config = server_config(&settings);
        assert_eq!(config.port, 8080);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
    }

    #[test]
    fn telemetry_level_comes_from_settings() {
        let mut settings = KnockSettings::default();
        settings.logging.level = "debug".into();
        let config = telemetry_config(&settings).unwrap();
        assert_eq!(config.log_level, tracing::Level::DEBUG);
    }
}
