//! Session State Machine
//!
//! The per-lobby authoritative state: members, host, phase, sequence
//! number and game payload. Every mutation goes through this type while
//! the caller holds the lobby's lock, so no two mutations of one lobby
//! ever interleave.
//!
//! Checks always run before anything is written; a rejected command leaves
//! the session untouched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::hash::StateHasher;
use crate::core::ids::{Identity, IdentityId, LobbyId};
use crate::game::rules::GameRules;
use crate::lobby::events::{CloseReason, EventKind, LeaveReason, SessionEvent};

/// Session phase. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Gathering members.
    Waiting,
    /// Game in progress.
    Active,
    /// Game over or lobby closed.
    Finished,
}

/// Who inherits host authority when the host departs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSuccession {
    /// Longest-standing remaining member.
    EarliestJoined,
    /// Most recent remaining member.
    LatestJoined,
}

impl HostSuccession {
    /// Parse from a config string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "earliest" | "earliest_joined" => Some(Self::EarliestJoined),
            "latest" | "latest_joined" => Some(Self::LatestJoined),
            _ => None,
        }
    }
}

/// Policy knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Minimum members to start, on top of the rules' own minimum.
    pub min_players: usize,
    /// Host succession rule.
    pub host_succession: HostSuccession,
    /// Hand host authority to a connected member as soon as the host
    /// drops, instead of waiting for the grace period to run out.
    pub transfer_host_on_disconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_players: 2,
            host_succession: HostSuccession::EarliestJoined,
            transfer_host_on_disconnect: true,
        }
    }
}

/// A lobby member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Who.
    pub identity: Identity,
    /// When they joined.
    pub joined_at: DateTime<Utc>,
    /// Whether their connection is currently attached.
    pub connected: bool,
}

/// Commands a member can issue against a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionCommand {
    /// Start the game (host only, waiting phase).
    Start,
    /// Game input, handed to the rules.
    Play {
        /// Rule-specific move.
        input: Value,
    },
    /// Hand host authority to another member (host only).
    TransferHost {
        /// New host.
        to: IdentityId,
    },
    /// Close the lobby (host only).
    Close,
}

impl SessionCommand {
    /// Command name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            SessionCommand::Start => "start",
            SessionCommand::Play { .. } => "play",
            SessionCommand::TransferHost { .. } => "transfer_host",
            SessionCommand::Close => "close",
        }
    }
}

/// Full point-in-time copy of a session, used for (re)sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Lobby id.
    pub lobby_id: LobbyId,
    /// Game name.
    pub game: String,
    /// Sequence number the snapshot reflects.
    pub sequence: u64,
    /// Roster version the snapshot reflects.
    #[serde(default)]
    pub roster: u64,
    /// Current phase.
    pub phase: Phase,
    /// Current host.
    pub host: IdentityId,
    /// Members in join order.
    pub members: Vec<Member>,
    /// Game payload.
    pub payload: Value,
    /// Hex SHA-256 over sequence, phase, host, members and payload.
    pub state_hash: String,
}

/// Session and lobby errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No identity attached to the connection.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Issuer is not a member of the lobby.
    #[error("Not a member of this lobby")]
    NotAMember,

    /// Issuer lacks authority (e.g. not the host).
    #[error("Not authorized: {0}")]
    NotAuthorized(&'static str),

    /// Command not legal in the current phase, or rejected by the rules.
    #[error("Illegal command: {0}")]
    IllegalCommand(String),

    /// Structurally invalid command payload.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Lobby does not exist.
    #[error("Lobby not found")]
    LobbyNotFound,

    /// Lobby is at capacity.
    #[error("Lobby is full")]
    LobbyFull,

    /// Capacity outside the allowed range.
    #[error("Invalid capacity: {0}")]
    CapacityInvalid(usize),

    /// Identity is already a member of a lobby.
    #[error("Already in a lobby")]
    AlreadyInLobby,

    /// Not enough members to start.
    #[error("Need {required} members to start, have {present}")]
    NotEnoughMembers {
        /// Minimum to start.
        required: usize,
        /// Current members.
        present: usize,
    },

    /// No rules registered under that name.
    #[error("Unknown game: {0}")]
    UnknownGame(String),

    /// Connection detached before the command was applied.
    #[error("Command cancelled")]
    Cancelled,

    /// Outbound channel to the connection is gone.
    #[error("Transport lost")]
    TransportLost,

    /// Internal invariant violation; fatal to the lobby only.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Authoritative state of one lobby.
pub struct Session {
    lobby_id: LobbyId,
    rules: Arc<dyn GameRules>,
    config: SessionConfig,
    members: Vec<Member>,
    host: IdentityId,
    phase: Phase,
    sequence: u64,
    roster: u64,
    payload: Value,
    closed: Option<CloseReason>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lobby_id", &self.lobby_id)
            .field("game", &self.rules.name())
            .field("phase", &self.phase)
            .field("sequence", &self.sequence)
            .field("members", &self.members.len())
            .finish()
    }
}

impl Session {
    /// Create a session whose creator is the first member and host.
    pub fn new(lobby_id: LobbyId, creator: Identity, rules: Arc<dyn GameRules>, config: SessionConfig) -> Self {
        let host = creator.id;
        Self {
            lobby_id,
            rules,
            config,
            members: vec![Member {
                identity: creator,
                joined_at: Utc::now(),
                connected: true,
            }],
            host,
            phase: Phase::Waiting,
            sequence: 0,
            roster: 0,
            payload: Value::Null,
            closed: None,
        }
    }

    /// Lobby id.
    pub fn lobby_id(&self) -> LobbyId {
        self.lobby_id
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Current sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Roster version: number of roster events emitted so far.
    pub fn roster_version(&self) -> u64 {
        self.roster
    }

    /// Current host.
    pub fn host(&self) -> IdentityId {
        self.host
    }

    /// Members in join order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Current payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Rules in use.
    pub fn rules(&self) -> &Arc<dyn GameRules> {
        &self.rules
    }

    /// Why the session closed, if it did.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.closed.as_ref()
    }

    /// Whether the session is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Whether `id` is a member.
    pub fn is_member(&self, id: &IdentityId) -> bool {
        self.members.iter().any(|m| m.identity.id == *id)
    }

    /// Member ids in join order.
    pub fn member_ids(&self) -> Vec<IdentityId> {
        self.members.iter().map(|m| m.identity.id).collect()
    }

    /// Admit a new member. Capacity is checked by the owning lobby.
    pub fn add_member(&mut self, identity: Identity) -> Result<SessionEvent, SessionError> {
        if self.is_closed() || self.phase != Phase::Waiting {
            return Err(SessionError::IllegalCommand("lobby is not accepting members".into()));
        }
        if self.is_member(&identity.id) {
            return Err(SessionError::AlreadyInLobby);
        }

        self.members.push(Member {
            identity: identity.clone(),
            joined_at: Utc::now(),
            connected: true,
        });
        Ok(self.roster_event(EventKind::MemberJoined(identity)))
    }

    /// Remove a member. Removing a non-member is a no-op.
    ///
    /// Emits `member_left`, then `host_changed` if the host left, then
    /// whatever the departure does to the game.
    pub fn remove_member(&mut self, id: &IdentityId, reason: LeaveReason) -> Result<Vec<SessionEvent>, SessionError> {
        let Some(index) = self.members.iter().position(|m| m.identity.id == *id) else {
            return Ok(Vec::new());
        };

        self.members.remove(index);
        let mut events = vec![self.roster_event(EventKind::MemberLeft { identity_id: *id, reason })];

        if self.members.is_empty() {
            match self.phase {
                Phase::Waiting if !self.is_closed() => {
                    let next = self.next_sequence()?;
                    self.phase = Phase::Finished;
                    self.closed = Some(CloseReason::Empty);
                    events.push(self.emit(next, EventKind::LobbyClosed(CloseReason::Empty)));
                }
                Phase::Active => {
                    let next = self.next_sequence()?;
                    self.phase = Phase::Finished;
                    events.push(self.emit(next, EventKind::PhaseChanged(Phase::Finished)));
                }
                _ => {}
            }
            return Ok(events);
        }

        if self.host == *id {
            if let Some(successor) = self.successor(id, false) {
                let next = self.next_sequence()?;
                self.host = successor;
                events.push(self.emit(next, EventKind::HostChanged { previous: Some(*id), host: successor }));
            }
        }

        if self.phase == Phase::Active {
            let remaining = self.member_ids();
            if let Some(transition) = self.rules.on_member_left(&self.payload, id, &remaining) {
                let next = self.next_sequence()?;
                if transition.outcome.is_terminal() {
                    self.phase = Phase::Finished;
                }
                self.payload = transition.state;
                events.push(self.emit(
                    next,
                    EventKind::StateUpdated {
                        issuer: None,
                        outcome: transition.outcome,
                        state: self.payload.clone(),
                    },
                ));
            }
        }

        Ok(events)
    }

    /// Record a member's connection dropping or coming back.
    pub fn set_presence(&mut self, id: &IdentityId, connected: bool) -> Result<Vec<SessionEvent>, SessionError> {
        let Some(member) = self.members.iter_mut().find(|m| m.identity.id == *id) else {
            return Ok(Vec::new());
        };
        if member.connected == connected {
            return Ok(Vec::new());
        }
        member.connected = connected;

        let mut events = vec![self.roster_event(EventKind::MemberPresence { identity_id: *id, connected })];

        let host_dropped = !connected && self.host == *id;
        if host_dropped && self.config.transfer_host_on_disconnect && self.phase != Phase::Finished {
            if let Some(successor) = self.successor(id, true) {
                let next = self.next_sequence()?;
                self.host = successor;
                events.push(self.emit(next, EventKind::HostChanged { previous: Some(*id), host: successor }));
            }
        }

        Ok(events)
    }

    /// Validate and apply one command.
    ///
    /// Checks, in order: membership, phase, host authority, then the rules.
    pub fn apply_command(&mut self, issuer: &IdentityId, command: SessionCommand) -> Result<SessionEvent, SessionError> {
        if self.is_closed() {
            return Err(SessionError::IllegalCommand("lobby is closed".into()));
        }
        if !self.is_member(issuer) {
            return Err(SessionError::NotAMember);
        }

        match command {
            SessionCommand::Start => {
                if self.phase != Phase::Waiting {
                    return Err(self.wrong_phase("start"));
                }
                self.require_host(issuer)?;

                let required = self.config.min_players.max(self.rules.min_players());
                if self.members.len() < required {
                    return Err(SessionError::NotEnoughMembers {
                        required,
                        present: self.members.len(),
                    });
                }

                let next = self.next_sequence()?;
                self.payload = self.rules.initial_state(&self.member_ids());
                self.phase = Phase::Active;
                Ok(self.emit(next, EventKind::PhaseChanged(Phase::Active)))
            }

            SessionCommand::Play { input } => {
                if self.phase != Phase::Active {
                    return Err(self.wrong_phase("play"));
                }

                let transition = self
                    .rules
                    .apply(&self.payload, issuer, &input)
                    .map_err(|v| SessionError::IllegalCommand(v.to_string()))?;

                let next = self.next_sequence()?;
                if transition.outcome.is_terminal() {
                    self.phase = Phase::Finished;
                }
                self.payload = transition.state;
                Ok(self.emit(
                    next,
                    EventKind::StateUpdated {
                        issuer: Some(*issuer),
                        outcome: transition.outcome,
                        state: self.payload.clone(),
                    },
                ))
            }

            SessionCommand::TransferHost { to } => {
                if self.phase == Phase::Finished {
                    return Err(self.wrong_phase("transfer_host"));
                }
                self.require_host(issuer)?;
                if to == self.host || !self.is_member(&to) {
                    return Err(SessionError::IllegalCommand("transfer target must be another member".into()));
                }

                let next = self.next_sequence()?;
                let previous = self.host;
                self.host = to;
                Ok(self.emit(next, EventKind::HostChanged { previous: Some(previous), host: to }))
            }

            SessionCommand::Close => {
                self.require_host(issuer)?;

                let next = self.next_sequence()?;
                self.phase = Phase::Finished;
                self.closed = Some(CloseReason::ClosedByHost);
                Ok(self.emit(next, EventKind::LobbyClosed(CloseReason::ClosedByHost)))
            }
        }
    }

    /// Mark the session failed after an internal inconsistency.
    ///
    /// Returns `None` if it was already closed.
    pub fn fail(&mut self, detail: impl Into<String>) -> Option<SessionEvent> {
        if self.is_closed() {
            return None;
        }
        let reason = CloseReason::Failed { detail: detail.into() };
        self.phase = Phase::Finished;
        self.closed = Some(reason.clone());
        self.sequence = self.sequence.saturating_add(1);
        Some(SessionEvent::new(self.lobby_id, self.sequence, EventKind::LobbyClosed(reason)).with_roster(self.roster))
    }

    /// Point-in-time copy for resync.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            lobby_id: self.lobby_id,
            game: self.rules.name().to_string(),
            sequence: self.sequence,
            roster: self.roster,
            phase: self.phase,
            host: self.host,
            members: self.members.clone(),
            payload: self.payload.clone(),
            state_hash: self.state_hash().map(hex::encode).unwrap_or_default(),
        }
    }

    /// Hash of everything a client mirrors.
    pub fn state_hash(&self) -> Result<[u8; 32], bincode::Error> {
        let mut hasher = StateHasher::for_snapshot();
        hasher.update_lobby(&self.lobby_id);
        hasher.update_u64(self.sequence);
        hasher.update_encoded(&self.phase)?;
        hasher.update_identity(&self.host);
        hasher.update_u64(self.members.len() as u64);
        for member in &self.members {
            hasher.update_identity(&member.identity.id);
        }
        hasher.update_encoded(&self.payload)?;
        Ok(hasher.finalize())
    }

    /// Invariant violations, empty when healthy.
    pub fn check_invariants(&self, capacity: usize) -> Vec<String> {
        let mut problems = Vec::new();

        if self.members.len() > capacity {
            problems.push(format!("{} members exceed capacity {}", self.members.len(), capacity));
        }

        let mut ids = self.member_ids();
        ids.sort();
        ids.dedup();
        if ids.len() != self.members.len() {
            problems.push("duplicate member".to_string());
        }

        if !self.members.is_empty() && !self.is_member(&self.host) {
            problems.push(format!("host {} is not a member", self.host.short()));
        }

        problems
    }

    fn roster_event(&mut self, kind: EventKind) -> SessionEvent {
        self.roster = self.roster.wrapping_add(1);
        SessionEvent::new(self.lobby_id, self.sequence, kind).with_roster(self.roster)
    }

    fn next_sequence(&self) -> Result<u64, SessionError> {
        self.sequence
            .checked_add(1)
            .ok_or_else(|| SessionError::Internal("sequence number exhausted".into()))
    }

    fn emit(&mut self, next: u64, kind: EventKind) -> SessionEvent {
        self.sequence = next;
        SessionEvent::new(self.lobby_id, next, kind).with_roster(self.roster)
    }

    fn require_host(&self, issuer: &IdentityId) -> Result<(), SessionError> {
        if *issuer == self.host {
            Ok(())
        } else {
            Err(SessionError::NotAuthorized("only the host may do that"))
        }
    }

    fn wrong_phase(&self, command: &str) -> SessionError {
        SessionError::IllegalCommand(format!("{} is not allowed while {:?}", command, self.phase))
    }

    fn successor(&self, departing: &IdentityId, connected_only: bool) -> Option<IdentityId> {
        let mut candidates = self
            .members
            .iter()
            .filter(|m| m.identity.id != *departing && (!connected_only || m.connected))
            .map(|m| m.identity.id);

        match self.config.host_succession {
            HostSuccession::EarliestJoined => candidates.next(),
            HostSuccession::LatestJoined => candidates.last(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::rules::{Outcome, RuleViolation, Transition};
    use proptest::prelude::*;
    use serde_json::json;

    /// Adds `n` to a shared total; ends at 10.
    #[derive(Debug)]
    struct Tally;

    impl GameRules for Tally {
        fn name(&self) -> &str {
            "tally"
        }

        fn initial_state(&self, _players: &[IdentityId]) -> Value {
            json!({ "total": 0 })
        }

        fn apply(&self, state: &Value, _issuer: &IdentityId, input: &Value) -> Result<Transition, RuleViolation> {
            let n = input["n"].as_u64().ok_or_else(|| RuleViolation::InvalidMove("n".into()))?;
            let total = state["total"].as_u64().unwrap_or(0) + n;
            let next = json!({ "total": total });
            if total >= 10 {
                Ok(Transition::finished(next, None))
            } else {
                Ok(Transition::next(next))
            }
        }
    }

    fn identity(n: u8) -> Identity {
        Identity::new(IdentityId::from_bytes([n; 16]), format!("player-{}", n))
    }

    fn session_with(n: u8) -> Session {
        let mut session = Session::new(
            LobbyId::from_bytes([9; 16]),
            identity(1),
            Arc::new(Tally),
            SessionConfig::default(),
        );
        for i in 2..=n {
            session.add_member(identity(i)).unwrap();
        }
        session
    }

    fn play(n: u64) -> SessionCommand {
        SessionCommand::Play { input: json!({ "n": n }) }
    }

    #[test]
    fn test_start_requires_host() {
        let mut session = session_with(2);
        let (a, b) = (identity(1).id, identity(2).id);

        let err = session.apply_command(&b, SessionCommand::Start).unwrap_err();
        assert!(matches!(err, SessionError::NotAuthorized(_)));
        assert_eq!(session.sequence(), 0);
        assert_eq!(session.phase(), Phase::Waiting);

        let event = session.apply_command(&a, SessionCommand::Start).unwrap();
        assert_eq!(event.sequence, 1);
        assert_eq!(event.kind, EventKind::PhaseChanged(Phase::Active));
        assert_eq!(session.phase(), Phase::Active);
        assert_eq!(session.payload(), &json!({ "total": 0 }));
    }

    #[test]
    fn test_start_needs_enough_members() {
        let mut session = session_with(1);
        let err = session.apply_command(&identity(1).id, SessionCommand::Start).unwrap_err();
        assert_eq!(err, SessionError::NotEnoughMembers { required: 2, present: 1 });
    }

    #[test]
    fn test_phase_checked_before_authority() {
        let mut session = session_with(2);
        let err = session.apply_command(&identity(2).id, play(1)).unwrap_err();
        assert!(matches!(err, SessionError::IllegalCommand(_)));
    }

    #[test]
    fn test_non_member_rejected() {
        let mut session = session_with(2);
        session.apply_command(&identity(1).id, SessionCommand::Start).unwrap();
        let before = (session.sequence(), session.payload().clone());

        let err = session.apply_command(&identity(7).id, play(3)).unwrap_err();
        assert_eq!(err, SessionError::NotAMember);
        assert_eq!((session.sequence(), session.payload().clone()), before);
    }

    #[test]
    fn test_terminal_outcome_finishes() {
        let mut session = session_with(2);
        let a = identity(1).id;
        session.apply_command(&a, SessionCommand::Start).unwrap();
        session.apply_command(&a, play(4)).unwrap();

        let event = session.apply_command(&identity(2).id, play(6)).unwrap();
        match event.kind {
            EventKind::StateUpdated { outcome, issuer, .. } => {
                assert_eq!(outcome, Outcome::Finished { winner: None });
                assert_eq!(issuer, Some(identity(2).id));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(session.phase(), Phase::Finished);

        // No phase is revisited
        let err = session.apply_command(&a, SessionCommand::Start).unwrap_err();
        assert!(matches!(err, SessionError::IllegalCommand(_)));
    }

    #[test]
    fn test_rule_rejection_leaves_state() {
        let mut session = session_with(2);
        let a = identity(1).id;
        session.apply_command(&a, SessionCommand::Start).unwrap();

        let bad = SessionCommand::Play { input: json!({ "m": 1 }) };
        let err = session.apply_command(&a, bad).unwrap_err();
        assert!(matches!(err, SessionError::IllegalCommand(_)));
        assert_eq!(session.sequence(), 1);
    }

    #[test]
    fn test_host_leaving_transfers_to_earliest() {
        let mut session = session_with(3);
        let events = session.remove_member(&identity(1).id, LeaveReason::Left).unwrap();

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].kind, EventKind::MemberLeft { .. }));
        assert_eq!(
            events[1].kind,
            EventKind::HostChanged { previous: Some(identity(1).id), host: identity(2).id }
        );
        assert_eq!(session.host(), identity(2).id);
        assert_eq!(events[1].sequence, 1);
    }

    #[test]
    fn test_latest_joined_policy() {
        let mut session = Session::new(
            LobbyId::from_bytes([9; 16]),
            identity(1),
            Arc::new(Tally),
            SessionConfig {
                host_succession: HostSuccession::LatestJoined,
                ..Default::default()
            },
        );
        session.add_member(identity(2)).unwrap();
        session.add_member(identity(3)).unwrap();

        session.remove_member(&identity(1).id, LeaveReason::Left).unwrap();
        assert_eq!(session.host(), identity(3).id);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut session = session_with(2);
        assert_eq!(session.remove_member(&identity(2).id, LeaveReason::Left).unwrap().len(), 1);
        assert!(session.remove_member(&identity(2).id, LeaveReason::Left).unwrap().is_empty());
    }

    #[test]
    fn test_last_member_leaving_closes_waiting_lobby() {
        let mut session = session_with(1);
        let events = session.remove_member(&identity(1).id, LeaveReason::TimedOut).unwrap();

        assert_eq!(events.len(), 2);
        assert!(!events.iter().any(|e| matches!(e.kind, EventKind::HostChanged { .. })));
        assert_eq!(events[1].kind, EventKind::LobbyClosed(CloseReason::Empty));
        assert_eq!(session.phase(), Phase::Finished);
        assert!(session.is_closed());
    }

    #[test]
    fn test_all_leaving_active_game_forces_finish() {
        let mut session = session_with(2);
        session.apply_command(&identity(1).id, SessionCommand::Start).unwrap();

        session.remove_member(&identity(1).id, LeaveReason::Left).unwrap();
        let events = session.remove_member(&identity(2).id, LeaveReason::Left).unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::PhaseChanged(Phase::Finished));
        assert_eq!(session.phase(), Phase::Finished);
    }

    #[test]
    fn test_host_disconnect_transfers_to_connected_member() {
        let mut session = session_with(3);
        session.set_presence(&identity(2).id, false).unwrap();

        let events = session.set_presence(&identity(1).id, false).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1].kind,
            EventKind::HostChanged { previous: Some(identity(1).id), host: identity(3).id }
        );

        // Reconnecting does not restore authority or re-announce a join
        let events = session.set_presence(&identity(1).id, true).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].kind, EventKind::MemberPresence { connected: true, .. }));
        assert_eq!(session.host(), identity(3).id);
    }

    #[test]
    fn test_roster_version_counts_roster_events() {
        let mut session = session_with(1);
        assert_eq!(session.roster_version(), 0);

        let joined = session.add_member(identity(2)).unwrap();
        assert_eq!((joined.sequence, joined.roster), (0, 1));

        let presence = session.set_presence(&identity(2).id, false).unwrap();
        assert_eq!(presence[0].roster, 2);

        // Non-roster events carry the roster version without bumping it
        let left = session.remove_member(&identity(1).id, LeaveReason::Left).unwrap();
        assert_eq!(left.iter().map(|e| e.roster).collect::<Vec<_>>(), vec![3, 3]);
        assert!(matches!(left[1].kind, EventKind::HostChanged { .. }));
        assert_eq!(left[1].sequence, 1);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.roster, 3);
        assert_eq!(snapshot.sequence, 1);
    }

    #[test]
    fn test_sole_host_disconnect_keeps_authority() {
        let mut session = session_with(1);
        let events = session.set_presence(&identity(1).id, false).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(session.host(), identity(1).id);
    }

    #[test]
    fn test_transfer_and_close() {
        let mut session = session_with(2);
        let (a, b) = (identity(1).id, identity(2).id);

        let err = session
            .apply_command(&a, SessionCommand::TransferHost { to: identity(5).id })
            .unwrap_err();
        assert!(matches!(err, SessionError::IllegalCommand(_)));

        session.apply_command(&a, SessionCommand::TransferHost { to: b }).unwrap();
        assert_eq!(session.host(), b);

        let err = session.apply_command(&a, SessionCommand::Close).unwrap_err();
        assert!(matches!(err, SessionError::NotAuthorized(_)));

        let event = session.apply_command(&b, SessionCommand::Close).unwrap();
        assert_eq!(event.kind, EventKind::LobbyClosed(CloseReason::ClosedByHost));
        assert!(session.is_closed());
        assert!(session.apply_command(&b, SessionCommand::Start).is_err());
    }

    #[test]
    fn test_snapshot_hash_tracks_state() {
        let mut session = session_with(2);
        let before = session.snapshot();
        assert_eq!(before.state_hash.len(), 64);

        session.apply_command(&identity(1).id, SessionCommand::Start).unwrap();
        let after = session.snapshot();
        assert_ne!(before.state_hash, after.state_hash);
        assert_eq!(after.sequence, 1);
        assert_eq!(after.members.len(), 2);
    }

    #[test]
    fn test_fail_closes_once() {
        let mut session = session_with(2);
        let event = session.fail("boom").unwrap();
        assert!(matches!(event.kind, EventKind::LobbyClosed(CloseReason::Failed { .. })));
        assert_eq!(session.phase(), Phase::Finished);
        assert!(session.fail("again").is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Play(u8, u64),
        Leave(u8),
        Presence(u8, bool),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u8..6, 0u64..4).prop_map(|(who, n)| Op::Play(who, n)),
            (1u8..6).prop_map(Op::Leave),
            (1u8..6, any::<bool>()).prop_map(|(who, c)| Op::Presence(who, c)),
        ]
    }

    proptest! {
        #[test]
        fn prop_sequence_is_gapless(ops in proptest::collection::vec(op(), 0..40)) {
            let mut session = session_with(4);
            let mut last = session.sequence();
            let event = session.apply_command(&identity(1).id, SessionCommand::Start).unwrap();
            prop_assert_eq!(event.sequence, last + 1);
            last = event.sequence;

            for op in ops {
                let before_payload = session.payload().clone();
                let events = match op {
                    Op::Play(who, n) => {
                        let is_member = session.is_member(&identity(who).id);
                        match session.apply_command(&identity(who).id, play(n)) {
                            Ok(event) => vec![event],
                            Err(e) => {
                                if !is_member {
                                    prop_assert_eq!(e, SessionError::NotAMember);
                                }
                                prop_assert_eq!(session.sequence(), last);
                                prop_assert_eq!(session.payload(), &before_payload);
                                continue;
                            }
                        }
                    }
                    Op::Leave(who) => session.remove_member(&identity(who).id, LeaveReason::Left).unwrap(),
                    Op::Presence(who, c) => session.set_presence(&identity(who).id, c).unwrap(),
                };

                for event in events {
                    if event.kind.advances_sequence() {
                        prop_assert_eq!(event.sequence, last + 1);
                        last = event.sequence;
                    } else {
                        prop_assert_eq!(event.sequence, last);
                    }
                }
                prop_assert!(session.check_invariants(4).is_empty());
            }
        }
    }
}
