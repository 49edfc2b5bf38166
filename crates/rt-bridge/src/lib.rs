//! rt-bridge: Device-resident terminal bridge for relay-terminal
//!
//! The bridge keeps one outbound WebSocket to a relay server and exposes
//! local shell sessions to remote clients through it. Each remote client
//! gets its own PTY; the relay never sees host credentials.

pub mod agent;
pub mod auth;
pub mod dispatcher;
pub mod pty;
pub mod relay;
pub mod session;
pub mod state;

pub use agent::BridgeAgent;
pub use auth::{AuthGate, TokenVerifier, UnverifiedTokens};
pub use dispatcher::Dispatcher;
pub use state::BridgeState;
