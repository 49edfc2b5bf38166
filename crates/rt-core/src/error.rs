//! Core error types for the bridge

use rt_protocol::{ConnectionId, ProtocolError};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Relay link error
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Relay link errors
///
/// All of these are recovered by the reconnect loop; none is fatal.
#[derive(Error, Debug)]
pub enum LinkError {
    /// A frame was sent while the link was not connected
    #[error("Not connected to relay")]
    NotConnected,

    /// The transport handshake failed
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    /// The transport failed mid-stream
    #[error("Transport error: {0}")]
    Transport(String),

    /// Nothing was heard from the relay within the idle timeout
    #[error("Relay idle for longer than {0:?}")]
    IdleTimeout(std::time::Duration),

    /// The link was closed locally
    #[error("Link closed")]
    Closed,

    /// An outgoing frame could not be encoded
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] ProtocolError),
}

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// A session already exists for this connection
    #[error("Session already exists: {0}")]
    AlreadyExists(ConnectionId),

    /// PTY allocation failed
    #[error("PTY allocation failed: {0}")]
    PtyAllocation(String),

    /// The shell or multiplexer could not be launched
    #[error("Failed to launch {command}: {reason}")]
    Spawn { command: String, reason: String },

    /// The terminal handle is closed or the child has exited
    #[error("Terminal is closed")]
    Closed,

    /// Input could not be queued within the I/O timeout
    #[error("Terminal write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    /// Session limit exceeded
    #[error("Session limit reached ({0})")]
    LimitExceeded(u32),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Config file could not be read or written
    #[error("Config file {path} could not be accessed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON parse error
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),
}
