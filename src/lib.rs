//! # Lobby Sync Server
//!
//! Authoritative lobby and session synchronization over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    LOBBY SYNC SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared primitives                         │
//! │  ├── ids.rs      - Identity, lobby and connection ids        │
//! │  └── hash.rs     - Snapshot state hashing                    │
//! │                                                              │
//! │  game/           - Pluggable rule sets                       │
//! │  ├── rules.rs    - GameRules capability                      │
//! │  ├── race.rs     - Race to a target total                    │
//! │  └── tictactoe.rs- Two-player tic-tac-toe                    │
//! │                                                              │
//! │  lobby/          - Authoritative state                       │
//! │  ├── session.rs  - Session state machine                     │
//! │  ├── events.rs   - Sequenced session events                  │
//! │  └── store.rs    - Lobby catalog and membership              │
//! │                                                              │
//! │  network/        - Transport                                 │
//! │  ├── registry.rs - Connections and grace periods             │
//! │  ├── dispatcher.rs - Per-lobby fan-out                       │
//! │  ├── router.rs   - Request routing                           │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── auth.rs     - Token verification                        │
//! │  └── server.rs   - WebSocket server                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering Guarantee
//!
//! Each lobby is guarded by its own lock. Commands are applied, stamped and
//! published under that lock, so every subscriber sees a lobby's events in
//! the order they were applied, with non-decreasing sequence numbers.
//! Clients that fall behind resync from a snapshot.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod lobby;
pub mod network;

// Re-export commonly used types
pub use core::ids::{ConnectionId, Identity, IdentityId, LobbyId};
pub use game::{GameCatalog, GameRules};
pub use lobby::{LobbyStore, Phase, Session, SessionCommand, SessionError, SessionEvent, SessionSnapshot};
pub use network::{CommandRouter, LobbyServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
