//! Identifiers
//!
//! Typed wrappers around UUIDs for identities, lobbies and connections.
//! All of them implement `Ord` so they can key a `BTreeMap` and iterate
//! in a stable order.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a fresh random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from raw bytes.
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Parse from a UUID string.
            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }

            /// Get raw bytes.
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// First four bytes as hex, for log lines.
            pub fn short(&self) -> String {
                hex::encode(&self.as_bytes()[..4])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Stable identifier of an authenticated user.
    IdentityId
);

uuid_id!(
    /// Lobby identifier.
    LobbyId
);

uuid_id!(
    /// Transport-level connection identifier. Doubles as the resume token a
    /// client presents when it reconnects inside the grace period.
    ConnectionId
);

/// A verified identity, produced by the authentication layer.
///
/// Immutable once attached to a connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable id.
    pub id: IdentityId,
    /// Name shown to other members.
    pub display_name: String,
}

impl Identity {
    /// Create a new identity.
    pub fn new(id: IdentityId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_uuid_strings() {
        let id = LobbyId::from_bytes([7; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"07070707-0707-0707-0707-070707070707\"");

        let parsed: LobbyId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_short_form() {
        let id = IdentityId::from_bytes([0xab; 16]);
        assert_eq!(id.short(), "abababab");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ConnectionId::parse("not-a-uuid").is_none());
        let id = ConnectionId::generate();
        assert_eq!(ConnectionId::parse(&id.to_string()), Some(id));
    }
}
