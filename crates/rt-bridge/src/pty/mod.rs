//! Pseudo-terminal sessions
//!
//! Allocates PTYs via portable-pty and launches either a plain shell or a
//! tmux session on the slave side.

mod launch;
mod session;
mod utf8;

pub use launch::{find_multiplexer, multiplexer_session_name, resolve_shell, SpawnOptions};
pub use session::{ChildExit, PtyOutput, PtySession};
pub use utf8::Utf8Decoder;
