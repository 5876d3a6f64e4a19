//! MQTT Forwarder
//!
//! Usage:
//!   mqtt-forwarder [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (TOML)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help
//!
//! Without a config file every setting comes from the environment
//! (`LOCAL_MQTT_URL`, `REMOTE_TOPIC_PREFIX`, ... or `FORWARDER__*`).

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mqtt_forwarder::bridge::{remote_topic, Bridge};
use mqtt_forwarder::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// MQTT Forwarder - relay local broker messages to a remote broker
#[derive(Parser, Debug)]
#[command(name = "mqtt-forwarder")]
#[command(author = "MQTT Forwarder Contributors")]
#[command(version)]
#[command(about = "Relay messages from a local MQTT broker to a remote one under a topic prefix")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

/// CLI level, then RUST_LOG, then the config file
fn log_filter(cli: Option<LogLevel>, configured: &str) -> EnvFilter {
    if let Some(level) = cli {
        return EnvFilter::new(level.as_str());
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured))
}

/// Wait for Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => eprintln!("Failed to listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Configuration problems are fatal before any connection is attempted
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(args.log_level, &config.log.level))
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    info!("Starting MQTT Forwarder v{}", env!("CARGO_PKG_VERSION"));
    info!("  Local broker: {}", config.local.url);
    info!("  Local topic: {}", config.local.topic);
    info!("  Remote broker: {}", config.remote.url);
    info!(
        "  Rewrite: {} -> {}",
        config.local.topic,
        remote_topic(&config.remote.topic_prefix, &config.local.topic)
    );
    info!(
        "  Reconnect delay: {}ms to {}ms",
        config.reconnect.initial_delay_ms, config.reconnect.max_delay_ms
    );

    let mut bridge = match Bridge::new(config) {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };
    bridge.start();

    shutdown_signal().await;
    info!("Shutdown signal received");

    bridge.shutdown().await;
    info!("MQTT Forwarder stopped");

    Ok(())
}
