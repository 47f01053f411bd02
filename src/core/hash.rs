//! Snapshot Hashing
//!
//! Provides deterministic hashing of session state so a client can check
//! that the state it rebuilt from events matches the server's snapshot.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::ids::{IdentityId, LobbyId};

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Deterministic hasher for session state.
///
/// Wraps SHA-256 with helpers for the session's field types.
/// Order of updates is critical for determinism.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for a session snapshot.
    pub fn for_snapshot() -> Self {
        Self::new(b"LOBBY_SYNC_SNAPSHOT_V1")
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a lobby id.
    #[inline]
    pub fn update_lobby(&mut self, id: &LobbyId) {
        self.hasher.update(id.as_bytes());
    }

    /// Update with an identity id.
    #[inline]
    pub fn update_identity(&mut self, id: &IdentityId) {
        self.hasher.update(id.as_bytes());
    }

    /// Update with the canonical binary encoding of a serializable value.
    ///
    /// Length-prefixed so adjacent fields cannot run into each other.
    pub fn update_encoded<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), bincode::Error> {
        let bytes = bincode::serialize(value)?;
        self.update_u64(bytes.len() as u64);
        self.hasher.update(&bytes);
        Ok(())
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Compute hash with domain separator.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let hash = |seq: u64| {
            let mut h = StateHasher::for_snapshot();
            h.update_lobby(&LobbyId::from_bytes([1; 16]));
            h.update_u64(seq);
            h.update_encoded(&serde_json::json!({"total": 3})).unwrap();
            h.finalize()
        };

        assert_eq!(hash(4), hash(4));
        assert_ne!(hash(4), hash(5));
    }

    #[test]
    fn test_domain_separation() {
        assert_ne!(hash_with_domain(b"a", b"data"), hash_with_domain(b"b", b"data"));
    }
}
