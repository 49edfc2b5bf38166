//! Routing of inbound relay frames
//!
//! The dispatcher is the only place that knows which frame kinds the bridge
//! reacts to. Frames for unknown sessions, frames the bridge never expects
//! to receive, and frames that fail to decode are logged and dropped; none
//! of them ends the connection.

use std::sync::Arc;

use serde_json::Value;

use rt_core::{FrameSink, SessionError};
use rt_protocol::{ConnectionId, FrameCodec, Message, ProtocolError, TerminalSize};

use crate::session::spawn_output_pump;
use crate::state::BridgeState;

/// Routes decoded frames to the session table, the auth gate and the PTYs
#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<BridgeState>,
    sink: Arc<dyn FrameSink>,
    codec: FrameCodec,
}

impl Dispatcher {
    /// Create a dispatcher replying through `sink`
    pub fn new(state: Arc<BridgeState>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            state,
            sink,
            codec: FrameCodec::new(),
        }
    }

    pub fn state(&self) -> &Arc<BridgeState> {
        &self.state
    }

    /// Decode and route one text frame
    pub async fn dispatch_text(&self, text: &str) {
        match self.codec.decode(text) {
            Ok(message) => self.dispatch(message).await,
            Err(ProtocolError::UnknownKind(kind)) => {
                tracing::warn!("Ignoring frame of unknown type '{}'", kind);
            }
            Err(e) => {
                tracing::warn!("Dropping malformed frame: {}", e);
            }
        }
    }

    /// Route one decoded frame
    pub async fn dispatch(&self, message: Message) {
        tracing::trace!("Dispatching {} frame", message.kind());

        match message {
            Message::ClientConnect {
                connection_id,
                auth_token,
                telegram_user_id,
            } => {
                self.handle_connect(connection_id, &telegram_user_id, &auth_token)
                    .await
            }

            Message::TerminalInput {
                connection_id,
                data,
            } => self.handle_input(connection_id, data).await,

            Message::TerminalResize {
                connection_id,
                cols,
                rows,
            } => self.handle_resize(&connection_id, TerminalSize::new(cols, rows)),

            Message::ClientDisconnect { connection_id } => self.handle_disconnect(&connection_id),

            Message::Ping {} => self.reply(Message::Pong {}).await,

            other => {
                tracing::warn!("Ignoring unexpected {} frame from relay", other.kind());
            }
        }
    }

    async fn handle_connect(&self, id: ConnectionId, user: &str, token: &Value) {
        tracing::info!("Connect request {} from user '{}'", id, user);

        if !self.state.auth.authorize(user, token) {
            self.reply(Message::AuthFailed {
                connection_id: id,
                error: "user is not authorized on this device".to_string(),
            })
            .await;
            return;
        }

        if let Some(existing) = self.state.sessions().get(&id) {
            if existing.user_id() == user {
                tracing::debug!("Re-acknowledging live session {}", id);
                self.reply(self.ready(id)).await;
            } else {
                tracing::warn!(
                    "Connection {} already belongs to another user, refusing '{}'",
                    id,
                    user
                );
                self.reply(Message::ConnectionFailed {
                    connection_id: id,
                    error: "connection id already in use".to_string(),
                })
                .await;
            }
            return;
        }

        match self.state.open_session(&id, user) {
            Ok(session) => {
                tracing::info!(
                    "Session {} opened for user '{}' (PID {:?}, persistent: {})",
                    id,
                    user,
                    session.pty().pid(),
                    session.is_persistent()
                );
                // Ready goes out before any output can
                self.reply(self.ready(id)).await;
                spawn_output_pump(self.state.clone(), session, self.sink.clone());
            }
            Err(e) => {
                tracing::warn!("Failed to open session {}: {}", id, e);
                let error = match e {
                    SessionError::LimitExceeded(_) => "session limit reached".to_string(),
                    other => other.to_string(),
                };
                self.reply(Message::ConnectionFailed {
                    connection_id: id,
                    error,
                })
                .await;
            }
        }
    }

    async fn handle_input(&self, id: ConnectionId, data: String) {
        let Some(session) = self.state.sessions().get(&id) else {
            tracing::warn!("Input for unknown session {}", id);
            return;
        };

        if data.is_empty() {
            return;
        }

        match session.write(data.as_bytes()).await {
            Ok(()) => {}
            Err(SessionError::Closed) => {
                tracing::info!("Session {} terminal is gone, tearing down", id);
                self.state.retire(session);
            }
            Err(e) => {
                tracing::warn!("Dropping input for session {}: {}", id, e);
            }
        }
    }

    fn handle_resize(&self, id: &ConnectionId, size: TerminalSize) {
        let Some(session) = self.state.sessions().get(id) else {
            tracing::warn!("Resize for unknown session {}", id);
            return;
        };

        if size.cols == 0 || size.rows == 0 {
            tracing::warn!(
                "Ignoring resize of session {} to {}x{}",
                id,
                size.cols,
                size.rows
            );
            return;
        }

        session.resize(size);
    }

    fn handle_disconnect(&self, id: &ConnectionId) {
        if self.state.teardown(id) {
            tracing::info!("Client disconnected from session {}", id);
        } else {
            tracing::warn!("Disconnect for unknown session {}", id);
        }
    }

    fn ready(&self, id: ConnectionId) -> Message {
        Message::ConnectionReady {
            connection_id: id,
            message: format!("connected to {}", self.state.identity.device_name),
        }
    }

    async fn reply(&self, message: Message) {
        let kind = message.kind();
        if let Err(e) = self.sink.send(message).await {
            tracing::warn!("Failed to send {} frame: {}", kind, e);
        }
    }
}
