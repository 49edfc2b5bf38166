//! Live sessions: one remote client attached to one terminal

mod pump;
mod table;

pub use pump::spawn_output_pump;
pub use table::SessionTable;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rt_core::time::{current_time_millis, elapsed_duration};
use rt_core::SessionError;
use rt_protocol::{ConnectionId, TerminalSize};

use crate::pty::{ChildExit, PtySession};

/// A live session
///
/// Owns the terminal exclusively; the terminal and its child are released
/// together by [`close`](Self::close).
#[derive(Debug)]
pub struct Session {
    connection_id: ConnectionId,
    /// Remote user who opened the session
    user_id: String,
    /// Unix millis at creation
    created_at: u64,
    /// Whether the shell lives in a multiplexer session that survives us
    persistent: bool,
    pty: PtySession,
    /// Cancels this session's output task
    cancel: CancellationToken,
    /// Time the child gets between SIGTERM and SIGKILL
    close_grace: Duration,
}

impl Session {
    /// Wrap a freshly opened terminal
    pub fn new(
        connection_id: ConnectionId,
        user_id: impl Into<String>,
        persistent: bool,
        pty: PtySession,
        cancel: CancellationToken,
        close_grace: Duration,
    ) -> Self {
        Self {
            connection_id,
            user_id: user_id.into(),
            created_at: current_time_millis(),
            persistent,
            pty,
            cancel,
            close_grace,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn pty(&self) -> &PtySession {
        &self.pty
    }

    /// Token observed by the output task
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Forward input to the terminal
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.pty.write(data).await
    }

    /// Resize the terminal
    pub fn resize(&self, size: TerminalSize) {
        self.pty.resize(size);
    }

    /// Stop the output task and tear the terminal down
    ///
    /// Safe to call more than once; only the first call signals the child.
    pub async fn close(&self) -> Option<ChildExit> {
        self.cancel.cancel();
        let first = !self.pty.is_closed();
        let exit = self.pty.close(self.close_grace).await;

        if first {
            tracing::info!(
                "Session {} for user {} closed after {:?} (exit {:?})",
                self.connection_id,
                self.user_id,
                elapsed_duration(self.created_at),
                exit.and_then(|e| e.code)
            );
        }
        exit
    }
}
