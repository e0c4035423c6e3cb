//! # huddle
//!
//! Signaling server binary: loads configuration, installs telemetry and runs
//! the WebSocket server until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use huddle_server::ServerConfig;
use huddle_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use tracing::Level;

/// Room-based WebRTC signaling server.
#[derive(Parser, Debug)]
#[command(name = "huddle", about = "Room-based signaling server")]
struct Cli {
    /// JSON config file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Keep empty rooms until the periodic reaper removes them.
    #[arg(long)]
    retain_empty_rooms: bool,

    /// Default log level. `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Per-module level override, e.g. `huddle_room=debug`. Repeatable.
    #[arg(long = "log-module", value_parser = parse_module_level)]
    log_modules: Vec<(String, Level)>,

    /// Log output format: `json` or `pretty`.
    #[arg(long, default_value = "json", value_parser = parse_log_format)]
    log_format: LogFormat,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.retain_empty_rooms {
            config.room_cleanup = huddle_room::RoomCleanupPolicy::Retain;
        }
        Ok(config)
    }
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    match s {
        "json" => Ok(LogFormat::Json),
        "pretty" => Ok(LogFormat::Pretty),
        other => Err(format!("unknown log format `{other}` (expected json or pretty)")),
    }
}

fn parse_module_level(s: &str) -> Result<(String, Level), String> {
    let (module, level) = s
        .split_once('=')
        .ok_or_else(|| format!("expected module=level, got `{s}`"))?;
    let level = level
        .parse::<Level>()
        .map_err(|e| format!("bad level for `{module}`: {e}"))?;
    Ok((module.to_owned(), level))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        module_levels: cli.log_modules.clone(),
        log_format: cli.log_format,
        ..Default::default()
    });

    let config = cli.server_config()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        room_cleanup = ?config.room_cleanup,
        "starting huddle"
    );

    let handle = huddle_server::start(config, &telemetry)
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port, "huddle ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
