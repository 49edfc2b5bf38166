//! Message types for the relay-terminal protocol
//!
//! Every frame is a JSON object whose `type` field names one of the kinds
//! below. Field names match the relay's wire format exactly.
//!
//! # Message Flow
//!
//! 1. Bridge connects and sends `device_register`
//! 2. Relay sends `ping` periodically, bridge answers `pong`
//! 3. A remote client attaches: relay sends `client_connect`, bridge answers
//!    `connection_ready`, `connection_failed` or `auth_failed`
//! 4. Terminal I/O: `terminal_input` in, `terminal_output` out
//! 5. Window resize: `terminal_resize` from relay
//! 6. Client leaves: `client_disconnect` from relay

use serde::{Deserialize, Serialize};

use crate::session::ConnectionId;

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of columns
    pub cols: u16,
    /// Number of rows
    pub rows: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Features a device advertises when it registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Interactive terminal sessions
    pub terminal: bool,
    /// Persistent sessions through tmux
    pub tmux: bool,
    /// File transfer (never offered by this bridge)
    pub file_transfer: bool,
}

/// Message kind, as carried in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    DeviceRegister,
    ClientConnect,
    ConnectionReady,
    ConnectionFailed,
    AuthFailed,
    TerminalInput,
    TerminalOutput,
    TerminalResize,
    ClientDisconnect,
    Ping,
    Pong,
}

impl MessageKind {
    /// All kinds defined by the protocol
    pub const ALL: [MessageKind; 11] = [
        MessageKind::DeviceRegister,
        MessageKind::ClientConnect,
        MessageKind::ConnectionReady,
        MessageKind::ConnectionFailed,
        MessageKind::AuthFailed,
        MessageKind::TerminalInput,
        MessageKind::TerminalOutput,
        MessageKind::TerminalResize,
        MessageKind::ClientDisconnect,
        MessageKind::Ping,
        MessageKind::Pong,
    ];

    /// The wire name of this kind
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::DeviceRegister => "device_register",
            MessageKind::ClientConnect => "client_connect",
            MessageKind::ConnectionReady => "connection_ready",
            MessageKind::ConnectionFailed => "connection_failed",
            MessageKind::AuthFailed => "auth_failed",
            MessageKind::TerminalInput => "terminal_input",
            MessageKind::TerminalOutput => "terminal_output",
            MessageKind::TerminalResize => "terminal_resize",
            MessageKind::ClientDisconnect => "client_disconnect",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
        }
    }

    /// Look up a kind by its wire name
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol messages exchanged between the bridge and the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Device announces itself after every successful connect (bridge → relay)
    DeviceRegister {
        device_id: String,
        device_name: String,
        platform: String,
        status: String,
        capabilities: Capabilities,
    },

    /// A remote client wants a terminal (relay → bridge)
    ClientConnect {
        connection_id: ConnectionId,
        /// Proof of identity; carried but not yet verified
        #[serde(default = "empty_token")]
        auth_token: serde_json::Value,
        #[serde(default, deserialize_with = "string_or_number::deserialize")]
        telegram_user_id: String,
    },

    /// Session is up (bridge → relay)
    ConnectionReady {
        connection_id: ConnectionId,
        message: String,
    },

    /// Session could not be started (bridge → relay)
    ConnectionFailed {
        connection_id: ConnectionId,
        error: String,
    },

    /// Remote user is not allowed on this device (bridge → relay)
    AuthFailed {
        connection_id: ConnectionId,
        error: String,
    },

    /// Keystrokes for a session (relay → bridge)
    TerminalInput {
        connection_id: ConnectionId,
        #[serde(default)]
        data: String,
    },

    /// Terminal output for a session (bridge → relay)
    TerminalOutput {
        connection_id: ConnectionId,
        data: String,
    },

    /// Window size change (relay → bridge)
    TerminalResize {
        connection_id: ConnectionId,
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default = "default_rows")]
        rows: u16,
    },

    /// Remote client left (relay → bridge)
    ClientDisconnect { connection_id: ConnectionId },

    /// Liveness probe (relay → bridge)
    Ping {},

    /// Liveness reply (bridge → relay)
    Pong {},
}

impl Message {
    /// Get the kind of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::DeviceRegister { .. } => MessageKind::DeviceRegister,
            Message::ClientConnect { .. } => MessageKind::ClientConnect,
            Message::ConnectionReady { .. } => MessageKind::ConnectionReady,
            Message::ConnectionFailed { .. } => MessageKind::ConnectionFailed,
            Message::AuthFailed { .. } => MessageKind::AuthFailed,
            Message::TerminalInput { .. } => MessageKind::TerminalInput,
            Message::TerminalOutput { .. } => MessageKind::TerminalOutput,
            Message::TerminalResize { .. } => MessageKind::TerminalResize,
            Message::ClientDisconnect { .. } => MessageKind::ClientDisconnect,
            Message::Ping {} => MessageKind::Ping,
            Message::Pong {} => MessageKind::Pong,
        }
    }

    /// The connection this message is about, if any
    pub fn connection_id(&self) -> Option<&ConnectionId> {
        match self {
            Message::ClientConnect { connection_id, .. }
            | Message::ConnectionReady { connection_id, .. }
            | Message::ConnectionFailed { connection_id, .. }
            | Message::AuthFailed { connection_id, .. }
            | Message::TerminalInput { connection_id, .. }
            | Message::TerminalOutput { connection_id, .. }
            | Message::TerminalResize { connection_id, .. }
            | Message::ClientDisconnect { connection_id } => Some(connection_id),
            Message::DeviceRegister { .. } | Message::Ping {} | Message::Pong {} => None,
        }
    }
}

fn empty_token() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_cols() -> u16 {
    DEFAULT_COLS
}

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

/// Chat platforms send user ids as numbers, other clients as strings.
///
/// Anything else is kept in its JSON text form (`null` becomes empty) so a
/// malformed id still reaches authorization and gets rejected there.
mod string_or_number {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::from_wire("shell_exec"), None);
    }

    #[test]
    fn test_client_connect_numeric_user_id() {
        let json = r#"{"type":"client_connect","connection_id":"A","telegram_user_id":42}"#;
        let msg: Message = serde_json::from_str(json).unwrap();

        match msg {
            Message::ClientConnect {
                connection_id,
                auth_token,
                telegram_user_id,
            } => {
                assert_eq!(connection_id.as_str(), "A");
                assert_eq!(telegram_user_id, "42");
                assert!(auth_token.as_object().unwrap().is_empty());
            }
            other => panic!("Expected ClientConnect, got {:?}", other),
        }
    }

    #[test]
    fn test_client_connect_odd_user_ids() {
        let user_of = |raw: &str| {
            let json = format!(
                r#"{{"type":"client_connect","connection_id":"A","telegram_user_id":{}}}"#,
                raw
            );
            match serde_json::from_str::<Message>(&json).unwrap() {
                Message::ClientConnect {
                    telegram_user_id, ..
                } => telegram_user_id,
                other => panic!("Expected ClientConnect, got {:?}", other),
            }
        };

        assert_eq!(user_of("null"), "");
        assert_eq!(user_of("42.0"), "42.0");
        assert_eq!(user_of("-7"), "-7");
        assert_eq!(user_of("true"), "true");
    }

    #[test]
    fn test_resize_defaults() {
        let json = r#"{"type":"terminal_resize","connection_id":"A"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            Message::TerminalResize {
                connection_id: "A".into(),
                cols: 80,
                rows: 24,
            }
        );
    }

    #[test]
    fn test_ping_tolerates_extra_fields() {
        let msg: Message = serde_json::from_str(r#"{"type":"ping","ts":123}"#).unwrap();
        assert_eq!(msg.kind(), MessageKind::Ping);
        assert!(msg.connection_id().is_none());
    }

    #[test]
    fn test_device_register_shape() {
        let msg = Message::DeviceRegister {
            device_id: "dev_0123456789ab".into(),
            device_name: "laptop".into(),
            platform: "linux".into(),
            status: "online".into(),
            capabilities: Capabilities {
                terminal: true,
                tmux: false,
                file_transfer: false,
            },
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "device_register");
        assert_eq!(value["capabilities"]["terminal"], true);
        assert_eq!(value["capabilities"]["file_transfer"], false);
    }

    #[test]
    fn test_pong_serializes_bare() {
        let json = serde_json::to_string(&Message::Pong {}).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }
}
