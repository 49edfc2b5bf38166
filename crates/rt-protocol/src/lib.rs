//! rt-protocol: Wire protocol for the relay-terminal bridge
//!
//! Frames are JSON objects carried as text messages over the relay's
//! WebSocket transport. Every frame names its kind in a `type` field.

pub mod codec;
pub mod error;
pub mod message;
pub mod session;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use message::{Capabilities, Message, MessageKind, TerminalSize};
pub use session::ConnectionId;
