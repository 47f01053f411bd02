//! Broadcast Dispatcher
//!
//! Per-lobby topics plus a directory topic for clients browsing lobbies.
//! Delivery is best effort: each subscriber's outbox is looked up in the
//! registry at publish time and written with `try_send`, so a slow or
//! detached client never stalls the lobby. Clients that miss events resync
//! from a snapshot.
//!
//! Callers publish while holding the lobby's lock, which is what keeps
//! per-lobby order equal to apply order. The dispatcher additionally
//! refuses a sequence number lower than one it has already sent.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::ids::{ConnectionId, IdentityId, LobbyId};
use crate::lobby::events::{DirectoryEvent, SessionEvent};
use crate::network::protocol::ServerMessage;
use crate::network::registry::{Attachment, ConnectionRegistry};

/// Dispatch errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// An event arrived with a sequence below one already delivered.
    #[error("Sequence regression in lobby {lobby_id}: {sequence} after {last}")]
    SequenceRegression {
        /// Lobby.
        lobby_id: LobbyId,
        /// Offending sequence.
        sequence: u64,
        /// Highest sequence already published.
        last: u64,
    },
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Outboxes that accepted the message.
    pub delivered: usize,
    /// Subscribers skipped (detached, full or closed outbox).
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct LobbyTopic {
    subscribers: BTreeSet<ConnectionId>,
    last_sequence: Option<u64>,
}

/// Fans events out to subscribed connections.
pub struct BroadcastDispatcher {
    registry: Arc<ConnectionRegistry>,
    topics: RwLock<BTreeMap<LobbyId, LobbyTopic>>,
    directory: RwLock<BTreeSet<ConnectionId>>,
}

impl BroadcastDispatcher {
    /// Create a dispatcher resolving outboxes through `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            topics: RwLock::new(BTreeMap::new()),
            directory: RwLock::new(BTreeSet::new()),
        }
    }

    /// Add a connection to a lobby's topic.
    pub async fn subscribe(&self, lobby_id: LobbyId, connection_id: ConnectionId) {
        self.topics
            .write()
            .await
            .entry(lobby_id)
            .or_default()
            .subscribers
            .insert(connection_id);
    }

    /// Subscribe and hand the connection its starting snapshot in one
    /// step, so nothing published afterwards can overtake it.
    pub async fn attach(&self, lobby_id: LobbyId, connection_id: ConnectionId, snapshot: ServerMessage) -> bool {
        self.subscribe(lobby_id, connection_id).await;
        self.send_to(connection_id, snapshot).await
    }

    /// Remove a connection from a lobby's topic.
    pub async fn unsubscribe(&self, lobby_id: LobbyId, connection_id: ConnectionId) {
        if let Some(topic) = self.topics.write().await.get_mut(&lobby_id) {
            topic.subscribers.remove(&connection_id);
        }
    }

    /// Remove a connection from every topic.
    pub async fn unsubscribe_all(&self, connection_id: ConnectionId) {
        for topic in self.topics.write().await.values_mut() {
            topic.subscribers.remove(&connection_id);
        }
        self.directory.write().await.remove(&connection_id);
    }

    /// Forget a destroyed lobby's topic.
    pub async fn drop_topic(&self, lobby_id: LobbyId) {
        self.topics.write().await.remove(&lobby_id);
    }

    /// Connection currently bound to an identity, live or in its grace
    /// period.
    pub async fn connection_of(&self, identity_id: &IdentityId) -> Option<ConnectionId> {
        self.registry.connection_of(identity_id).await
    }

    /// Whether `attachment` is still the live socket of its connection.
    pub async fn is_current(&self, attachment: Attachment) -> bool {
        self.registry.is_current(attachment).await
    }

    /// Subscribers of a lobby.
    pub async fn subscribers(&self, lobby_id: LobbyId) -> Vec<ConnectionId> {
        self.topics
            .read()
            .await
            .get(&lobby_id)
            .map(|t| t.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Deliver an event to every subscriber of its lobby.
    pub async fn publish(&self, event: &SessionEvent) -> Result<Delivery, DispatchError> {
        let subscribers: Vec<ConnectionId> = {
            let mut topics = self.topics.write().await;
            let topic = topics.entry(event.lobby_id).or_default();

            if let Some(last) = topic.last_sequence {
                if event.sequence < last {
                    return Err(DispatchError::SequenceRegression {
                        lobby_id: event.lobby_id,
                        sequence: event.sequence,
                        last,
                    });
                }
            }
            topic.last_sequence = Some(event.sequence);
            topic.subscribers.iter().copied().collect()
        };

        #[cfg(feature = "debug-tracing")]
        debug!(
            "Publishing seq {} to {} subscribers of {}",
            event.sequence,
            subscribers.len(),
            event.lobby_id.short()
        );

        let message = ServerMessage::Event(event.clone());
        Ok(self.fan_out(&subscribers, &message).await)
    }

    /// Deliver a lobby's final event and drop its topic. Skips the sequence
    /// check, so a lobby failed by a regression still reaches its members.
    pub async fn publish_closing(&self, event: &SessionEvent) -> Delivery {
        let subscribers: Vec<ConnectionId> = self
            .topics
            .write()
            .await
            .remove(&event.lobby_id)
            .map(|topic| topic.subscribers.into_iter().collect())
            .unwrap_or_default();

        self.fan_out(&subscribers, &ServerMessage::Event(event.clone())).await
    }

    /// Start receiving directory changes.
    pub async fn watch_directory(&self, connection_id: ConnectionId) {
        self.directory.write().await.insert(connection_id);
    }

    /// Stop receiving directory changes.
    pub async fn unwatch_directory(&self, connection_id: ConnectionId) {
        self.directory.write().await.remove(&connection_id);
    }

    /// Deliver a directory change to every watcher.
    pub async fn publish_directory(&self, event: DirectoryEvent) -> Delivery {
        let watchers: Vec<ConnectionId> = self.directory.read().await.iter().copied().collect();
        self.fan_out(&watchers, &ServerMessage::Directory(event)).await
    }

    /// Send one message to one connection. `false` if it was dropped.
    pub async fn send_to(&self, connection_id: ConnectionId, message: ServerMessage) -> bool {
        let Some(outbox) = self.registry.outbox(connection_id).await else {
            debug!("Dropping message for detached connection {}", connection_id.short());
            return false;
        };

        match outbox.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Outbox full for {}, dropping message", connection_id.short());
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Outbox closed for {}", connection_id.short());
                false
            }
        }
    }

    async fn fan_out(&self, targets: &[ConnectionId], message: &ServerMessage) -> Delivery {
        let mut delivery = Delivery::default();
        for connection_id in targets {
            if self.send_to(*connection_id, message.clone()).await {
                delivery.delivered += 1;
            } else {
                delivery.dropped += 1;
            }
        }
        delivery
    }
}
