//! Connection Registry
//!
//! Maps transport connections to verified identities and tracks their
//! liveness. A dropped connection enters a grace period instead of being
//! forgotten; the client can resume it with the same connection id and
//! keep its lobby membership. When the grace period runs out the sweep
//! evicts it.
//!
//! Time is passed in by the caller so deadlines can be driven by tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::core::ids::{ConnectionId, Identity, IdentityId};
use crate::network::protocol::{Outbox, ServerMessage};

/// Default grace period after a disconnect.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Liveness of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Socket attached.
    Connected,
    /// Socket gone; may resume until `deadline`.
    GracePeriod {
        /// When the socket dropped.
        since: Instant,
        /// Last instant a resume is accepted.
        deadline: Instant,
    },
}

/// Result of attaching a socket to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    /// Connection id (resume token).
    pub connection_id: ConnectionId,
    /// Bumped on every attachment. Only the current generation may mark
    /// the connection disconnected.
    pub generation: u64,
}

struct ConnectionEntry {
    identity: Identity,
    outbox: Outbox,
    liveness: Liveness,
    generation: u64,
    last_activity: Instant,
    registered_at: DateTime<Utc>,
}

/// Registry of live and recently dropped connections.
pub struct ConnectionRegistry {
    grace_period: Duration,
    connections: RwLock<BTreeMap<ConnectionId, Arc<Mutex<ConnectionEntry>>>>,
    by_identity: RwLock<BTreeMap<IdentityId, ConnectionId>>,
}

impl ConnectionRegistry {
    /// Create a registry with the given grace period.
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            connections: RwLock::new(BTreeMap::new()),
            by_identity: RwLock::new(BTreeMap::new()),
        }
    }

    /// Grace period length.
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Register a freshly authenticated connection.
    pub async fn register(&self, outbox: Outbox, identity: Identity, now: Instant) -> Attachment {
        let connection_id = ConnectionId::generate();
        let identity_id = identity.id;

        let entry = ConnectionEntry {
            identity,
            outbox,
            liveness: Liveness::Connected,
            generation: 1,
            last_activity: now,
            registered_at: Utc::now(),
        };

        {
            let mut connections = self.connections.write().await;
            connections.insert(connection_id, Arc::new(Mutex::new(entry)));
            self.by_identity.write().await.insert(identity_id, connection_id);
        }

        debug!("Registered connection {} for {}", connection_id.short(), identity_id.short());
        Attachment {
            connection_id,
            generation: 1,
        }
    }

    /// Start the grace period for a dropped socket.
    ///
    /// Ignored (returns `false`) when `generation` is not the current one,
    /// so a superseded socket closing late cannot detach its replacement.
    pub async fn mark_disconnected(&self, id: ConnectionId, generation: u64, now: Instant) -> bool {
        let Some(entry) = self.entry(id).await else {
            return false;
        };
        let mut entry = entry.lock().await;

        if entry.generation != generation || entry.liveness != Liveness::Connected {
            return false;
        }

        entry.liveness = Liveness::GracePeriod {
            since: now,
            deadline: now + self.grace_period,
        };
        debug!("Connection {} entered grace period", id.short());
        true
    }

    /// Attach a new socket to an existing connection.
    ///
    /// Succeeds inside the grace window, or on a still-connected entry whose
    /// old socket is told to shut down. Returns `None` once the deadline has
    /// passed; the client must authenticate afresh and rejoin.
    pub async fn reconnect(&self, id: ConnectionId, outbox: Outbox, now: Instant) -> Option<Attachment> {
        let entry = self.entry(id).await?;
        let mut entry = entry.lock().await;

        match entry.liveness {
            Liveness::GracePeriod { deadline, .. } if now > deadline => return None,
            Liveness::GracePeriod { .. } => {}
            Liveness::Connected => {
                let _ = entry.outbox.try_send(ServerMessage::Shutdown {
                    reason: "superseded by a newer connection".to_string(),
                });
            }
        }

        entry.outbox = outbox;
        entry.liveness = Liveness::Connected;
        entry.generation += 1;
        entry.last_activity = now;

        info!("Connection {} resumed (generation {})", id.short(), entry.generation);
        Some(Attachment {
            connection_id: id,
            generation: entry.generation,
        })
    }

    /// Connections whose grace period has run out.
    pub async fn expired(&self, now: Instant) -> Vec<ConnectionId> {
        let mut expired = Vec::new();
        for (id, entry) in self.entries().await {
            if let Liveness::GracePeriod { deadline, .. } = entry.lock().await.liveness {
                if now > deadline {
                    expired.push(id);
                }
            }
        }
        expired
    }

    /// Remove a connection, returning its identity.
    pub async fn evict(&self, id: ConnectionId) -> Option<Identity> {
        let (identity, registered_at) = {
            let mut connections = self.connections.write().await;
            let removed = connections.remove(&id)?;
            let mut by_identity = self.by_identity.write().await;
            let entry = removed.lock().await;
            if by_identity.get(&entry.identity.id) == Some(&id) {
                by_identity.remove(&entry.identity.id);
            }
            (entry.identity.clone(), entry.registered_at)
        };

        info!(
            "Evicted connection {} ({}) after {}s",
            id.short(),
            identity.id.short(),
            (Utc::now() - registered_at).num_seconds()
        );
        Some(identity)
    }

    /// When the connection was first registered. Resuming keeps it.
    pub async fn registered_at(&self, id: ConnectionId) -> Option<DateTime<Utc>> {
        let entry = self.entry(id).await?;
        let registered_at = entry.lock().await.registered_at;
        Some(registered_at)
    }

    /// Identity bound to a connection.
    pub async fn identity(&self, id: ConnectionId) -> Option<Identity> {
        let entry = self.entry(id).await?;
        let identity = entry.lock().await.identity.clone();
        Some(identity)
    }

    /// Current liveness.
    pub async fn liveness(&self, id: ConnectionId) -> Option<Liveness> {
        let entry = self.entry(id).await?;
        let liveness = entry.lock().await.liveness;
        Some(liveness)
    }

    /// Whether a socket is attached.
    pub async fn is_connected(&self, id: ConnectionId) -> bool {
        matches!(self.liveness(id).await, Some(Liveness::Connected))
    }

    /// Whether `attachment` is the socket currently attached. False for a
    /// superseded generation or during the grace period.
    pub async fn is_current(&self, attachment: Attachment) -> bool {
        let Some(entry) = self.entry(attachment.connection_id).await else {
            return false;
        };
        let entry = entry.lock().await;
        entry.liveness == Liveness::Connected && entry.generation == attachment.generation
    }

    /// Outbox of a connected socket; `None` during the grace period.
    pub async fn outbox(&self, id: ConnectionId) -> Option<Outbox> {
        let entry = self.entry(id).await?;
        let entry = entry.lock().await;
        match entry.liveness {
            Liveness::Connected => Some(entry.outbox.clone()),
            Liveness::GracePeriod { .. } => None,
        }
    }

    /// Connection currently bound to an identity.
    pub async fn connection_of(&self, identity: &IdentityId) -> Option<ConnectionId> {
        self.by_identity.read().await.get(identity).copied()
    }

    /// Record activity.
    pub async fn touch(&self, id: ConnectionId, now: Instant) {
        if let Some(entry) = self.entry(id).await {
            entry.lock().await.last_activity = now;
        }
    }

    /// Connected sockets silent for longer than `timeout`.
    pub async fn idle(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        let mut idle = Vec::new();
        for (id, entry) in self.entries().await {
            let entry = entry.lock().await;
            if entry.liveness == Liveness::Connected && now.duration_since(entry.last_activity) > timeout {
                idle.push(id);
            }
        }
        idle
    }

    /// Registered connections, including those in their grace period.
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Connections with an attached socket.
    pub async fn connected_count(&self) -> usize {
        let mut count = 0;
        for (_, entry) in self.entries().await {
            if entry.lock().await.liveness == Liveness::Connected {
                count += 1;
            }
        }
        count
    }

    async fn entry(&self, id: ConnectionId) -> Option<Arc<Mutex<ConnectionEntry>>> {
        self.connections.read().await.get(&id).cloned()
    }

    async fn entries(&self) -> Vec<(ConnectionId, Arc<Mutex<ConnectionEntry>>)> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn ana() -> Identity {
        Identity::new(IdentityId::from_bytes([1; 16]), "ana")
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ConnectionRegistry::default();
        let (tx, _rx) = mpsc::channel(8);
        let now = Instant::now();

        let attachment = registry.register(tx, ana(), now).await;
        assert_eq!(attachment.generation, 1);
        assert_eq!(registry.identity(attachment.connection_id).await, Some(ana()));
        assert_eq!(registry.connection_of(&ana().id).await, Some(attachment.connection_id));
        assert!(registry.outbox(attachment.connection_id).await.is_some());
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_reconnect_within_grace() {
        let registry = ConnectionRegistry::new(Duration::from_secs(30));
        let (tx, _rx) = mpsc::channel(8);
        let t0 = Instant::now();
        let first = registry.register(tx, ana(), t0).await;
        let id = first.connection_id;

        assert!(registry.mark_disconnected(id, first.generation, t0).await);
        assert!(registry.outbox(id).await.is_none());
        assert!(registry.expired(t0 + Duration::from_secs(29)).await.is_empty());

        let (tx2, _rx2) = mpsc::channel(8);
        let second = registry.reconnect(id, tx2, t0 + Duration::from_secs(29)).await.unwrap();
        assert_eq!(second.generation, 2);
        assert!(registry.is_connected(id).await);

        // The old socket closing late must not detach the new one
        assert!(!registry.mark_disconnected(id, first.generation, t0 + Duration::from_secs(30)).await);
        assert!(registry.is_connected(id).await);
    }

    #[tokio::test]
    async fn test_reconnect_after_grace_fails() {
        let registry = ConnectionRegistry::new(Duration::from_secs(30));
        let (tx, _rx) = mpsc::channel(8);
        let t0 = Instant::now();
        let first = registry.register(tx, ana(), t0).await;
        let id = first.connection_id;
        registry.mark_disconnected(id, first.generation, t0).await;

        let late = t0 + Duration::from_secs(31);
        let (tx2, _rx2) = mpsc::channel(8);
        assert!(registry.reconnect(id, tx2, late).await.is_none());
        assert_eq!(registry.expired(late).await, vec![id]);

        assert_eq!(registry.evict(id).await, Some(ana()));
        assert!(registry.identity(id).await.is_none());
        assert!(registry.connection_of(&ana().id).await.is_none());
        assert!(registry.evict(id).await.is_none());
        assert!(registry.registered_at(id).await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_live_socket() {
        let registry = ConnectionRegistry::default();
        let (tx, mut rx) = mpsc::channel(8);
        let t0 = Instant::now();
        let first = registry.register(tx, ana(), t0).await;

        let (tx2, _rx2) = mpsc::channel(8);
        let registered_at = registry.registered_at(first.connection_id).await.unwrap();
        let second = registry.reconnect(first.connection_id, tx2, t0).await.unwrap();
        assert_eq!(second.generation, 2);
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Shutdown { .. })));
        assert!(!registry.is_current(first).await);
        assert!(registry.is_current(second).await);
        assert_eq!(registry.registered_at(first.connection_id).await, Some(registered_at));
    }

    #[tokio::test]
    async fn test_idle_detection() {
        let registry = ConnectionRegistry::default();
        let (tx, _rx) = mpsc::channel(8);
        let t0 = Instant::now();
        let a = registry.register(tx, ana(), t0).await;

        let later = t0 + Duration::from_secs(120);
        assert_eq!(registry.idle(later, Duration::from_secs(60)).await, vec![a.connection_id]);

        registry.touch(a.connection_id, later).await;
        assert!(registry.idle(later, Duration::from_secs(60)).await.is_empty());
    }
}
