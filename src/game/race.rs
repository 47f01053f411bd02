//! Race to a Target
//!
//! Turn-based: on their turn a player adds between 1 and `max_step` to a
//! shared total. Whoever brings the total to `target` or beyond wins.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ids::IdentityId;
use crate::game::rules::{decode_state, encode_state, GameRules, RuleViolation, Transition};

/// Default target total.
pub const DEFAULT_TARGET: u32 = 21;

/// Default largest step per turn.
pub const DEFAULT_MAX_STEP: u32 = 3;

/// Rule set.
#[derive(Debug, Clone)]
pub struct RaceRules {
    /// Total that ends the game.
    pub target: u32,
    /// Largest amount a single move may add.
    pub max_step: u32,
}

impl Default for RaceRules {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET,
            max_step: DEFAULT_MAX_STEP,
        }
    }
}

/// Payload of a race game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceState {
    /// Total that ends the game.
    pub target: u32,
    /// Largest amount a single move may add.
    pub max_step: u32,
    /// Current total.
    pub total: u32,
    /// Seating order.
    pub turn_order: Vec<IdentityId>,
    /// Index into `turn_order` of whoever moves next.
    pub turn: usize,
}

impl RaceState {
    fn current(&self) -> Option<&IdentityId> {
        self.turn_order.get(self.turn)
    }
}

#[derive(Debug, Deserialize)]
struct RaceMove {
    add: u32,
}

impl GameRules for RaceRules {
    fn name(&self) -> &str {
        "race"
    }

    fn initial_state(&self, players: &[IdentityId]) -> Value {
        encode_state(&RaceState {
            target: self.target,
            max_step: self.max_step,
            total: 0,
            turn_order: players.to_vec(),
            turn: 0,
        })
    }

    fn apply(&self, state: &Value, issuer: &IdentityId, input: &Value) -> Result<Transition, RuleViolation> {
        let mut race: RaceState = decode_state(state)?;
        let mv: RaceMove = serde_json::from_value(input.clone())
            .map_err(|_| RuleViolation::InvalidMove("expected {\"add\": n}".into()))?;

        if !race.turn_order.contains(issuer) {
            return Err(RuleViolation::NotParticipant);
        }
        if race.current() != Some(issuer) {
            return Err(RuleViolation::OutOfTurn);
        }
        if mv.add == 0 || mv.add > race.max_step {
            return Err(RuleViolation::InvalidMove(format!(
                "add must be between 1 and {}",
                race.max_step
            )));
        }

        race.total = race.total.saturating_add(mv.add);
        if race.total >= race.target {
            return Ok(Transition::finished(encode_state(&race), Some(*issuer)));
        }

        race.turn = (race.turn + 1) % race.turn_order.len();
        Ok(Transition::next(encode_state(&race)))
    }

    fn on_member_left(&self, state: &Value, member: &IdentityId, remaining: &[IdentityId]) -> Option<Transition> {
        let mut race: RaceState = decode_state(state).ok()?;
        let seat = race.turn_order.iter().position(|id| id == member)?;

        race.turn_order.remove(seat);
        if seat < race.turn {
            race.turn -= 1;
        }
        if race.turn >= race.turn_order.len() {
            race.turn = 0;
        }

        match remaining {
            [last] => Some(Transition::finished(encode_state(&race), Some(*last))),
            [] => Some(Transition::finished(encode_state(&race), None)),
            _ => Some(Transition::next(encode_state(&race))),
        }
    }
}
