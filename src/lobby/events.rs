//! Session Events
//!
//! Immutable, sequence-stamped notifications of lobby state changes.
//! Events of one lobby are never reordered relative to each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ids::{Identity, IdentityId, LobbyId};
use crate::game::rules::Outcome;
use crate::lobby::session::Phase;
use crate::lobby::store::LobbySummary;

/// Why a member left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// Member asked to leave.
    Left,
    /// Grace period ran out after a disconnect.
    TimedOut,
}

/// Why a lobby closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CloseReason {
    /// Host closed it.
    ClosedByHost,
    /// Last member left before the game started.
    Empty,
    /// Lobby processing hit an internal inconsistency.
    Failed {
        /// What went wrong.
        detail: String,
    },
}

/// Event payloads, tagged by `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    /// A member joined.
    MemberJoined(Identity),

    /// A member left or was evicted.
    MemberLeft {
        identity_id: IdentityId,
        reason: LeaveReason,
    },

    /// A member's connection dropped or came back.
    MemberPresence {
        identity_id: IdentityId,
        connected: bool,
    },

    /// Host authority moved.
    HostChanged {
        previous: Option<IdentityId>,
        host: IdentityId,
    },

    /// Phase moved forward.
    PhaseChanged(Phase),

    /// Game payload changed.
    StateUpdated {
        /// Member whose input caused the change; `None` for departures.
        issuer: Option<IdentityId>,
        outcome: Outcome,
        state: Value,
    },

    /// Lobby closed; no further events follow.
    LobbyClosed(CloseReason),
}

impl EventKind {
    /// Roster events are stamped with the current sequence without
    /// advancing it.
    pub fn advances_sequence(&self) -> bool {
        !matches!(
            self,
            EventKind::MemberJoined(_) | EventKind::MemberLeft { .. } | EventKind::MemberPresence { .. }
        )
    }
}

/// One event of one lobby.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Lobby the event belongs to.
    pub lobby_id: LobbyId,
    /// Session sequence number after this event.
    pub sequence: u64,
    /// Roster version after this event. Bumped by every roster event, so a
    /// client can spot a missed join, leave or presence change.
    #[serde(default)]
    pub roster: u64,
    /// Type and payload.
    #[serde(flatten)]
    pub kind: EventKind,
    /// Server wall-clock time of emission.
    pub emitted_at: DateTime<Utc>,
}

impl SessionEvent {
    /// Stamp an event.
    pub fn new(lobby_id: LobbyId, sequence: u64, kind: EventKind) -> Self {
        Self {
            lobby_id,
            sequence,
            roster: 0,
            kind,
            emitted_at: Utc::now(),
        }
    }

    /// Stamp the roster version.
    pub fn with_roster(mut self, roster: u64) -> Self {
        self.roster = roster;
        self
    }
}

/// Changes to the open-lobby directory, for clients watching the lobby list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum DirectoryEvent {
    /// A lobby was created.
    LobbyOpened(LobbySummary),
    /// Member count or status changed.
    LobbyUpdated(LobbySummary),
    /// A lobby was destroyed.
    LobbyRemoved { lobby_id: LobbyId },
}
