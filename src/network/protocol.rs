//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are JSON text frames tagged by `type`.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::ids::{ConnectionId, Identity, LobbyId};
use crate::lobby::events::{DirectoryEvent, SessionEvent};
use crate::lobby::session::{SessionCommand, SessionError, SessionSnapshot};
use crate::lobby::store::LobbySummary;

/// Outbound channel to one connection's socket writer.
pub type Outbox = mpsc::Sender<ServerMessage>;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate, optionally resuming an earlier connection.
    Auth(AuthRequest),

    /// List open lobbies.
    ListLobbies,

    /// Create a lobby and become its host.
    CreateLobby {
        name: String,
        game: String,
        capacity: usize,
    },

    /// Join a lobby.
    JoinLobby { lobby_id: LobbyId },

    /// Leave a lobby.
    LeaveLobby { lobby_id: LobbyId },

    /// Issue a session command.
    Command {
        lobby_id: LobbyId,
        command: SessionCommand,
    },

    /// Request a full snapshot (after missed events).
    SyncRequest { lobby_id: LobbyId },

    /// Receive live lobby-directory changes.
    WatchLobbies,

    /// Stop receiving lobby-directory changes.
    UnwatchLobbies,

    /// Ping for latency measurement.
    Ping { timestamp: u64 },
}

/// Authentication request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Bearer token.
    pub token: String,
    /// Connection id from a previous `auth_result`, to resume inside the
    /// grace period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ConnectionId>,
    /// Client version.
    pub client_version: String,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Open lobbies.
    Lobbies { lobbies: Vec<LobbySummary> },

    /// Full session state; sent on create, join, resume and sync.
    Snapshot(SessionSnapshot),

    /// Confirmation that the client left a lobby.
    Left { lobby_id: LobbyId },

    /// Session event of a lobby the client belongs to.
    Event(SessionEvent),

    /// Lobby-directory change.
    Directory(DirectoryEvent),

    /// Error message.
    Error(ServerError),

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Server is closing this connection.
    Shutdown { reason: String },
}

/// Authentication result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Connection id; also the resume token.
    pub connection_id: Option<ConnectionId>,
    /// Verified identity.
    pub identity: Option<Identity>,
    /// Whether an earlier connection was resumed.
    pub resumed: bool,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Lobby the failed request targeted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lobby_id: Option<LobbyId>,
}

impl ServerError {
    /// Build from a session error.
    pub fn from_session(err: &SessionError, lobby_id: Option<LobbyId>) -> Self {
        Self {
            code: ErrorCode::from(err),
            message: err.to_string(),
            lobby_id,
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Malformed message or command.
    InvalidInput,
    /// Not a member of the lobby.
    NotAMember,
    /// Not allowed (e.g. not the host).
    NotAuthorized,
    /// Command not legal right now.
    IllegalCommand,
    /// Lobby not found.
    LobbyNotFound,
    /// Lobby is full.
    LobbyFull,
    /// Capacity out of range.
    CapacityInvalid,
    /// Already in a lobby.
    AlreadyInLobby,
    /// Not enough members to start.
    NotEnoughMembers,
    /// Unknown game.
    UnknownGame,
    /// Command dropped because the connection detached.
    Cancelled,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

impl From<&SessionError> for ErrorCode {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::NotAuthenticated => ErrorCode::NotAuthenticated,
            SessionError::NotAMember => ErrorCode::NotAMember,
            SessionError::NotAuthorized(_) => ErrorCode::NotAuthorized,
            SessionError::IllegalCommand(_) => ErrorCode::IllegalCommand,
            SessionError::InvalidCommand(_) => ErrorCode::InvalidInput,
            SessionError::LobbyNotFound => ErrorCode::LobbyNotFound,
            SessionError::LobbyFull => ErrorCode::LobbyFull,
            SessionError::CapacityInvalid(_) => ErrorCode::CapacityInvalid,
            SessionError::AlreadyInLobby => ErrorCode::AlreadyInLobby,
            SessionError::NotEnoughMembers { .. } => ErrorCode::NotEnoughMembers,
            SessionError::UnknownGame(_) => ErrorCode::UnknownGame,
            SessionError::Cancelled => ErrorCode::Cancelled,
            SessionError::TransportLost | SessionError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Lobby this message targets, if any.
    pub fn lobby_id(&self) -> Option<LobbyId> {
        match self {
            ClientMessage::JoinLobby { lobby_id }
            | ClientMessage::LeaveLobby { lobby_id }
            | ClientMessage::Command { lobby_id, .. }
            | ClientMessage::SyncRequest { lobby_id } => Some(*lobby_id),
            _ => None,
        }
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Error reply for a failed request.
    pub fn error(err: &SessionError, lobby_id: Option<LobbyId>) -> Self {
        ServerMessage::Error(ServerError::from_session(err, lobby_id))
    }

    /// Pong stamped with server time.
    pub fn pong(timestamp: u64) -> Self {
        ServerMessage::Pong {
            timestamp,
            server_time: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::IdentityId;
    use crate::lobby::events::EventKind;
    use crate::lobby::session::Phase;
    use serde_json::json;

    #[test]
    fn test_client_command_json() {
        let lobby_id = LobbyId::from_bytes([3; 16]);
        let text = json!({
            "type": "command",
            "lobby_id": lobby_id.to_string(),
            "command": { "type": "play", "input": { "add": 2 } }
        })
        .to_string();

        let parsed = ClientMessage::from_json(&text).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Command {
                lobby_id,
                command: SessionCommand::Play { input: json!({ "add": 2 }) },
            }
        );
        assert_eq!(parsed.lobby_id(), Some(lobby_id));
    }

    #[test]
    fn test_auth_resume_is_optional() {
        let parsed = ClientMessage::from_json(r#"{"type":"auth","token":"t","client_version":"1"}"#).unwrap();
        match parsed {
            ClientMessage::Auth(auth) => assert!(auth.resume.is_none()),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_event_message_shape() {
        let msg = ServerMessage::Event(SessionEvent::new(
            LobbyId::from_bytes([1; 16]),
            1,
            EventKind::PhaseChanged(Phase::Active),
        ));

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["sequence"], 1);
        assert_eq!(value["event_type"], "phase_changed");
        assert_eq!(value["payload"], "active");

        let parsed = ServerMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_directory_message_shape() {
        let msg = ServerMessage::Directory(DirectoryEvent::LobbyRemoved {
            lobby_id: LobbyId::from_bytes([4; 16]),
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"directory\""));
        assert!(json.contains("\"change\":\"lobby_removed\""));
    }

    #[test]
    fn test_error_codes() {
        let err = SessionError::NotAuthorized("only the host may do that");
        let msg = ServerMessage::error(&err, Some(LobbyId::from_bytes([5; 16])));
        let json = msg.to_json().unwrap();
        assert!(json.contains("not_authorized"));
        assert!(json.contains("lobby_id"));

        let err = SessionError::NotEnoughMembers { required: 2, present: 1 };
        assert_eq!(ErrorCode::from(&err), ErrorCode::NotEnoughMembers);
        assert_eq!(ErrorCode::from(&SessionError::InvalidCommand("x".into())), ErrorCode::InvalidInput);
    }

    #[test]
    fn test_auth_result_shape() {
        let msg = ServerMessage::AuthResult(AuthResult {
            success: true,
            connection_id: Some(ConnectionId::from_bytes([6; 16])),
            identity: Some(Identity::new(IdentityId::from_bytes([7; 16]), "ana")),
            resumed: false,
            error: None,
            server_version: "0.1.0".into(),
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"auth_result\""));
        assert!(json.contains("\"display_name\":\"ana\""));
    }
}
