//! Bridge configuration

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use super::backoff::BackoffConfig;
use super::serde_utils::{duration_millis, duration_secs, user_list};
use crate::error::ConfigError;
use crate::types::{generate_device_id, DeviceIdentity};

/// Configuration for the terminal bridge
///
/// Loaded once at startup. After [`BridgeConfig::resolve`] every optional
/// identity field is filled in, and the result is written back to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// WebSocket endpoint of the relay
    pub relay_url: String,

    /// Device identifier (generated when absent)
    pub device_id: Option<String>,

    /// Device name shown to remote users (defaults to host name)
    pub device_name: Option<String>,

    /// Remote user identities allowed to open sessions. Empty rejects everyone.
    #[serde(alias = "allowed_telegram_users", deserialize_with = "user_list::deserialize")]
    pub allowed_users: Vec<String>,

    /// Working directory for new shells (defaults to the home directory)
    pub work_dir: Option<PathBuf>,

    /// Attach sessions to a per-user tmux session when tmux is installed
    pub session_persistent: bool,

    /// Shell to launch (defaults to `$SHELL`, then `/bin/sh`)
    pub shell: Option<String>,

    /// Extra environment variables for new shells
    pub env: BTreeMap<String, String>,

    /// Maximum number of live sessions
    pub max_sessions: Option<u32>,

    /// Reconnect backoff
    pub backoff: BackoffConfig,

    /// Transport handshake timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Interval between WebSocket pings sent to the relay
    #[serde(with = "duration_secs")]
    pub ping_interval: Duration,

    /// Drop the link if nothing arrives from the relay for this long
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Time a child gets to exit after hangup before it is killed
    #[serde(rename = "close_grace_ms", with = "duration_millis")]
    pub close_grace: Duration,

    /// Upper bound on queueing input for a terminal
    #[serde(rename = "io_timeout_ms", with = "duration_millis")]
    pub io_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:8080/device".to_string(),
            device_id: None,
            device_name: None,
            allowed_users: Vec::new(),
            work_dir: None,
            session_persistent: true,
            shell: None,
            env: BTreeMap::new(),
            max_sessions: None,
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(15),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(40),
            close_grace: Duration::from_millis(500),
            io_timeout: Duration::from_millis(2000),
        }
    }
}

impl BridgeConfig {
    /// Fill in generated and host-derived defaults
    pub fn resolve(&mut self) {
        if self.device_id.as_deref().map_or(true, str::is_empty) {
            let id = generate_device_id();
            tracing::info!("Generated device id {}", id);
            self.device_id = Some(id);
        }
        if self.device_name.as_deref().map_or(true, str::is_empty) {
            self.device_name = Some(gethostname::gethostname().to_string_lossy().into_owned());
        }
        if self.work_dir.is_none() {
            self.work_dir = dirs::home_dir();
        }
    }

    /// Check settings that would otherwise fail at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.relay_url.starts_with("ws://") || self.relay_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "relay_url must be a ws:// or wss:// URL, got '{}'",
                self.relay_url
            )));
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "ping_interval must be at least one second".to_string(),
            ));
        }
        if self.idle_timeout <= self.ping_interval {
            return Err(ConfigError::Invalid(format!(
                "idle_timeout ({:?}) must be longer than ping_interval ({:?})",
                self.idle_timeout, self.ping_interval
            )));
        }
        if self.max_sessions == Some(0) {
            return Err(ConfigError::Invalid(
                "max_sessions must be at least 1 when set".to_string(),
            ));
        }
        self.backoff.validate()
    }

    /// Device name, falling back to the host name
    pub fn device_name(&self) -> String {
        self.device_name
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }

    /// Working directory for new shells
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
    }

    /// The whitelist as a set
    pub fn whitelist(&self) -> HashSet<String> {
        self.allowed_users.iter().cloned().collect()
    }

    /// Build the device identity advertised to the relay
    pub fn identity(&self, tmux_available: bool) -> DeviceIdentity {
        DeviceIdentity::new(
            self.device_id.clone().unwrap_or_else(generate_device_id),
            self.device_name(),
            tmux_available,
        )
    }
}
