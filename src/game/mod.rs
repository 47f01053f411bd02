//! Game Rules Module
//!
//! Pluggable rule sets, selected by name when a lobby is created.
//!
//! ## Module Structure
//!
//! - `rules`: The `GameRules` capability, transitions and outcomes
//! - `race`: Turn-based race to a target total
//! - `tictactoe`: Two-player tic-tac-toe

pub mod race;
pub mod rules;
pub mod tictactoe;

use std::collections::BTreeMap;
use std::sync::Arc;

// Re-export key types
pub use race::RaceRules;
pub use rules::{GameRules, Outcome, RuleViolation, Transition};
pub use tictactoe::TicTacToeRules;

/// Registry of rule sets available to lobby creators.
#[derive(Debug, Default, Clone)]
pub struct GameCatalog {
    games: BTreeMap<String, Arc<dyn GameRules>>,
}

impl GameCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the bundled games.
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(Arc::new(RaceRules::default()));
        catalog.register(Arc::new(TicTacToeRules));
        catalog
    }

    /// Add or replace a rule set under its own name.
    pub fn register(&mut self, rules: Arc<dyn GameRules>) {
        self.games.insert(rules.name().to_string(), rules);
    }

    /// Look up rules by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn GameRules>> {
        self.games.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.games.keys().map(String::as_str)
    }
}
