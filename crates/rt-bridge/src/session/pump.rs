//! Per-session output task
//!
//! Drains one terminal's output and forwards it to the relay as
//! `terminal_output` frames, in the order it was produced. When the child
//! exits the task removes its own session from the table; no external
//! reaper is involved.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;

use rt_core::{FrameSink, LinkError};
use rt_protocol::Message;

use super::Session;
use crate::pty::{PtyOutput, Utf8Decoder};
use crate::state::BridgeState;

/// How long to keep reading after the child exits while output still trickles in
const DRAIN_IDLE: Duration = Duration::from_millis(100);

/// Why the pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    /// Someone else is tearing the session down
    Cancelled,
    /// The terminal went away on its own
    Finished,
}

/// Start the output task for a session
pub fn spawn_output_pump(
    state: Arc<BridgeState>,
    session: Arc<Session>,
    sink: Arc<dyn FrameSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let id = session.connection_id().clone();

        let end = match session.pty().output() {
            Ok(output) => pump(&session, output, sink.as_ref()).await,
            Err(e) => {
                tracing::warn!("Cannot read output of session {}: {}", id, e);
                PumpEnd::Finished
            }
        };

        if end == PumpEnd::Finished {
            tracing::info!("Terminal for session {} ended", id);
            state.release(&session).await;
        }
        tracing::debug!("Output task for session {} stopped", id);
    })
}

async fn pump(session: &Session, mut output: PtyOutput, sink: &dyn FrameSink) -> PumpEnd {
    let cancel = session.cancel_token().clone();
    let mut decoder = Utf8Decoder::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return PumpEnd::Cancelled,

            chunk = output.next() => match chunk {
                Some(bytes) => forward(session, sink, decoder.decode(&bytes)).await,
                None => break,
            },

            _ = session.pty().wait_exit() => {
                // Background jobs may still hold the terminal open; take
                // whatever is already buffered and stop.
                while let Ok(Some(bytes)) = tokio::time::timeout(DRAIN_IDLE, output.next()).await {
                    forward(session, sink, decoder.decode(&bytes)).await;
                }
                break;
            }
        }
    }

    forward(session, sink, decoder.finish()).await;
    PumpEnd::Finished
}

async fn forward(session: &Session, sink: &dyn FrameSink, data: String) {
    if data.is_empty() {
        return;
    }

    tracing::trace!(
        "Session {} produced {} bytes of output",
        session.connection_id(),
        data.len()
    );

    let frame = Message::TerminalOutput {
        connection_id: session.connection_id().clone(),
        data,
    };

    match sink.send(frame).await {
        Ok(()) => {}
        Err(LinkError::NotConnected) => {
            tracing::trace!(
                "Relay down, dropping output for session {}",
                session.connection_id()
            );
        }
        Err(e) => {
            tracing::debug!(
                "Failed to forward output for session {}: {}",
                session.connection_id(),
                e
            );
        }
    }
}
