//! Tic-Tac-Toe
//!
//! Two players, 3x3 board, first seat plays `X`. A player leaving
//! mid-game forfeits.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ids::IdentityId;
use crate::game::rules::{decode_state, encode_state, GameRules, RuleViolation, Transition};

const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

/// Board mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mark {
    /// First seat.
    X,
    /// Second seat.
    O,
}

/// Payload of a tic-tac-toe game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicTacToeState {
    /// Cells 0..9, row-major.
    pub board: Vec<Option<Mark>>,
    /// Seat 0 plays X, seat 1 plays O.
    pub seats: Vec<IdentityId>,
    /// Seat index to move.
    pub next: usize,
}

impl TicTacToeState {
    fn winner(&self) -> Option<Mark> {
        LINES.iter().find_map(|line| {
            let first = self.board[line[0]]?;
            line.iter()
                .all(|&i| self.board[i] == Some(first))
                .then_some(first)
        })
    }

    fn seat_of(&self, mark: Mark) -> Option<IdentityId> {
        let seat = match mark {
            Mark::X => 0,
            Mark::O => 1,
        };
        self.seats.get(seat).copied()
    }
}

#[derive(Debug, Deserialize)]
struct Placement {
    cell: usize,
}

/// Rule set.
#[derive(Debug, Clone, Default)]
pub struct TicTacToeRules;

impl GameRules for TicTacToeRules {
    fn name(&self) -> &str {
        "tictactoe"
    }

    fn max_players(&self) -> Option<usize> {
        Some(2)
    }

    fn initial_state(&self, players: &[IdentityId]) -> Value {
        encode_state(&TicTacToeState {
            board: vec![None; 9],
            seats: players.iter().take(2).copied().collect(),
            next: 0,
        })
    }

    fn apply(&self, state: &Value, issuer: &IdentityId, input: &Value) -> Result<Transition, RuleViolation> {
        let mut game: TicTacToeState = decode_state(state)?;
        let placement: Placement = serde_json::from_value(input.clone())
            .map_err(|_| RuleViolation::InvalidMove("expected {\"cell\": 0..8}".into()))?;

        let seat = game
            .seats
            .iter()
            .position(|id| id == issuer)
            .ok_or(RuleViolation::NotParticipant)?;
        if seat != game.next {
            return Err(RuleViolation::OutOfTurn);
        }
        match game.board.get(placement.cell) {
            None => return Err(RuleViolation::InvalidMove(format!("cell {} is off the board", placement.cell))),
            Some(Some(_)) => return Err(RuleViolation::InvalidMove(format!("cell {} is taken", placement.cell))),
            Some(None) => {}
        }

        let mark = if seat == 0 { Mark::X } else { Mark::O };
        game.board[placement.cell] = Some(mark);

        if let Some(winner) = game.winner() {
            let winner = game.seat_of(winner);
            return Ok(Transition::finished(encode_state(&game), winner));
        }
        if game.board.iter().all(Option::is_some) {
            return Ok(Transition::finished(encode_state(&game), None));
        }

        game.next = 1 - game.next;
        Ok(Transition::next(encode_state(&game)))
    }

    fn on_member_left(&self, state: &Value, member: &IdentityId, _remaining: &[IdentityId]) -> Option<Transition> {
        let game: TicTacToeState = decode_state(state).ok()?;
        if !game.seats.contains(member) {
            return None;
        }
        let winner = game.seats.iter().find(|id| *id != member).copied();
        Some(Transition::finished(state.clone(), winner))
    }
}
