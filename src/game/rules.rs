//! Game Rules Capability
//!
//! A lobby's game is a pure state-transition function over an opaque JSON
//! payload. The session state machine owns the payload and calls into the
//! rules; rules never perform I/O and never see the lobby lock.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::ids::IdentityId;

/// Result tag of a transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// Game continues.
    Continue,
    /// Game reached a terminal state.
    Finished {
        /// Winner, or `None` for a draw.
        winner: Option<IdentityId>,
    },
}

impl Outcome {
    /// Whether this outcome ends the game.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Outcome::Finished { .. })
    }
}

/// New payload plus outcome tag.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    /// Payload after the transition.
    pub state: Value,
    /// Whether the game goes on.
    pub outcome: Outcome,
}

impl Transition {
    /// Non-terminal transition.
    pub fn next(state: Value) -> Self {
        Self {
            state,
            outcome: Outcome::Continue,
        }
    }

    /// Terminal transition.
    pub fn finished(state: Value, winner: Option<IdentityId>) -> Self {
        Self {
            state,
            outcome: Outcome::Finished { winner },
        }
    }
}

/// Reasons a rule set refuses an input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleViolation {
    /// Input is well-formed JSON but not a move this game understands.
    #[error("invalid move: {0}")]
    InvalidMove(String),

    /// Issuer tried to move outside their turn.
    #[error("not your turn")]
    OutOfTurn,

    /// Issuer is not seated in this game.
    #[error("not a participant in this game")]
    NotParticipant,

    /// Stored payload does not decode as this game's state.
    #[error("corrupt game state: {0}")]
    CorruptState(String),
}

/// A pluggable rule set.
///
/// Implementations must be pure: same inputs, same transition.
pub trait GameRules: Send + Sync + fmt::Debug {
    /// Name used to select the rules at lobby creation.
    fn name(&self) -> &str;

    /// Minimum members needed to start.
    fn min_players(&self) -> usize {
        2
    }

    /// Upper bound on members, if the game has one.
    fn max_players(&self) -> Option<usize> {
        None
    }

    /// Payload at the start of the game. `players` is in join order.
    fn initial_state(&self, players: &[IdentityId]) -> Value;

    /// Apply one player input.
    fn apply(&self, state: &Value, issuer: &IdentityId, input: &Value) -> Result<Transition, RuleViolation>;

    /// React to a player leaving mid-game. `None` leaves the payload as is.
    fn on_member_left(&self, _state: &Value, _member: &IdentityId, _remaining: &[IdentityId]) -> Option<Transition> {
        None
    }
}

/// Decode a stored payload into a typed game state.
pub(crate) fn decode_state<T: serde::de::DeserializeOwned>(state: &Value) -> Result<T, RuleViolation> {
    serde_json::from_value(state.clone()).map_err(|e| RuleViolation::CorruptState(e.to_string()))
}

/// Encode a typed game state back into a payload.
pub(crate) fn encode_state<T: Serialize>(state: &T) -> Value {
    serde_json::to_value(state).unwrap_or(Value::Null)
}
