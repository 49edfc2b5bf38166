//! relay-terminal bridge daemon
//!
//! Runs on the device whose shells are being shared. Keeps an outbound
//! WebSocket to the relay and spawns a PTY for every authorized remote
//! client.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rt_bridge::BridgeAgent;
use rt_core::config::{self, BridgeConfig};
use rt_core::ConfigError;

#[derive(Parser)]
#[command(name = "rt-bridge")]
#[command(about = "relay-terminal bridge - shares local shells with remote clients through a relay")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay WebSocket endpoint (ws:// or wss://)
    #[arg(long, env = "RT_RELAY_URL")]
    relay_url: Option<String>,

    /// Device name shown to remote clients (defaults to hostname)
    #[arg(long)]
    device_name: Option<String>,

    /// Allow a remote user (repeatable; added to the configured whitelist)
    #[arg(long = "allow-user", value_name = "USER")]
    allow_users: Vec<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Do not write the effective configuration back to disk
    #[arg(long)]
    no_save: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("relay-terminal bridge starting...");

    // Load configuration
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    let mut config: BridgeConfig = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(ConfigError::NotFound(_)) => {
            tracing::info!("No config at {:?}, using defaults", config_path);
            BridgeConfig::default()
        }
        Err(e) => {
            tracing::warn!("Failed to load config from {:?}: {}", config_path, e);
            BridgeConfig::default()
        }
    };

    // Apply command-line overrides
    if let Some(url) = args.relay_url {
        config.relay_url = url;
    }
    if let Some(name) = args.device_name {
        config.device_name = Some(name);
    }
    for user in args.allow_users {
        let user = user.trim().to_string();
        if !user.is_empty() && !config.allowed_users.contains(&user) {
            config.allowed_users.push(user);
        }
    }

    config.resolve();
    config.validate().context("Invalid configuration")?;

    if !args.no_save {
        config::save_config(&config_path, &config)
            .with_context(|| format!("Failed to write config to {:?}", config_path))?;
        tracing::debug!("Saved effective configuration to {:?}", config_path);
    }

    if config.allowed_users.is_empty() {
        tracing::warn!(
            "No allowed users configured; every connect request will be rejected. \
             Add users with --allow-user or the allowed_users config key."
        );
    }

    // Set up cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let agent = BridgeAgent::new(config, cancel.clone()).context("Failed to start bridge")?;

    if !agent.state().auth.verifies_tokens() {
        tracing::warn!(
            "Auth tokens are not verified; access is controlled by the user whitelist only"
        );
    }

    tracing::info!(
        "Device {} ({}) serving {} allowed user(s), tmux: {}",
        agent.state().identity.device_name,
        agent.state().identity.device_id,
        agent.state().config.allowed_users.len(),
        agent.state().has_multiplexer()
    );

    // Handle shutdown signals
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        cancel_clone.cancel();
    });

    agent.run().await;

    tracing::info!("Bridge stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
