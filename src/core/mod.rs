//! Core primitives.
//!
//! Typed identifiers and deterministic snapshot hashing, shared by the
//! lobby layer and the network layer.

pub mod hash;
pub mod ids;

// Re-export core types
pub use hash::{StateHash, StateHasher};
pub use ids::{ConnectionId, Identity, IdentityId, LobbyId};
