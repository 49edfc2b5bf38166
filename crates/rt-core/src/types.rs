//! Core domain types

use rt_protocol::{Capabilities, Message};
use std::fmt;

/// Status string sent with every registration
const STATUS_ONLINE: &str = "online";

/// Identity of this device, fixed for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Unique device identifier (`dev_` + 12 hex chars when generated)
    pub device_id: String,
    /// Human-readable device name
    pub device_name: String,
    /// Operating system name
    pub platform: String,
    /// Declared capabilities
    pub capabilities: Capabilities,
}

impl DeviceIdentity {
    /// Create an identity for the current platform
    pub fn new(device_id: impl Into<String>, device_name: impl Into<String>, tmux: bool) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            platform: std::env::consts::OS.to_string(),
            capabilities: Capabilities {
                terminal: true,
                tmux,
                file_transfer: false,
            },
        }
    }

    /// The `device_register` frame announcing this device
    pub fn registration(&self) -> Message {
        Message::DeviceRegister {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            platform: self.platform.clone(),
            status: STATUS_ONLINE.to_string(),
            capabilities: self.capabilities,
        }
    }
}

/// Generate a fresh device identifier
pub fn generate_device_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("dev_{}", &hex[..12])
}

/// State of the relay link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No transport; a reconnect may be pending
    Disconnected,
    /// Transport handshake in progress
    Connecting,
    /// Registered and exchanging frames
    Connected,
    /// Shutting down; no reconnect will follow
    Closing,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Closing => write!(f, "closing"),
        }
    }
}
