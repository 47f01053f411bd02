//! Lobby Module
//!
//! Lobby lifecycle and the authoritative per-lobby session.
//!
//! ## Module Structure
//!
//! - `session`: Session state machine (members, host, phase, sequence, payload)
//! - `events`: Sequence-stamped session events and directory changes
//! - `store`: Lobby catalog, membership index, listing and health checks

pub mod events;
pub mod session;
pub mod store;

// Re-export key types
pub use events::{CloseReason, DirectoryEvent, EventKind, LeaveReason, SessionEvent};
pub use session::{
    HostSuccession, Member, Phase, Session, SessionCommand, SessionConfig, SessionError, SessionSnapshot,
};
pub use store::{HealthReport, Lobby, LobbyConfig, LobbyListing, LobbyStatus, LobbyStore, LobbySummary, NewLobby};
