//! rt-core: Core abstractions and configuration for the relay-terminal bridge
//!
//! Shared error types, configuration, device identity and the sink trait
//! the dispatcher uses to talk back to the relay.

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{BridgeError, ConfigError, LinkError, SessionError};
pub use traits::FrameSink;
pub use types::{DeviceIdentity, LinkState};
