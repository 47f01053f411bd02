//! Lobby Store
//!
//! Catalog of lobbies and the identity → lobby membership index.
//!
//! Each lobby sits behind its own mutex; every session mutation and the
//! publish of its events happen under that lock, so lobbies run in parallel
//! while each one sees strictly serialized, ordered updates. The global map
//! is only write-locked for the brief insert/remove of a lobby and is never
//! held while waiting on a lobby.
//!
//! Lock order: lobby → dispatcher topics → registry. The membership index
//! and observed-sequence maps are leaf locks.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::core::ids::{ConnectionId, Identity, IdentityId, LobbyId};
use crate::game::rules::GameRules;
use crate::lobby::events::{DirectoryEvent, EventKind, LeaveReason, SessionEvent};
use crate::lobby::session::{
    HostSuccession, Phase, Session, SessionCommand, SessionConfig, SessionError, SessionSnapshot,
};
use crate::network::dispatcher::BroadcastDispatcher;
use crate::network::protocol::ServerMessage;
use crate::network::registry::Attachment;

/// Largest capacity a lobby may request by default.
pub const DEFAULT_MAX_CAPACITY: usize = 16;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Lobby policy.
#[derive(Debug, Clone)]
pub struct LobbyConfig {
    /// Upper bound on requested capacity.
    pub max_capacity: usize,
    /// Session policy applied to every new lobby.
    pub session: SessionConfig,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            max_capacity: DEFAULT_MAX_CAPACITY,
            session: SessionConfig::default(),
        }
    }
}

impl LobbyConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_capacity: std::env::var("MAX_LOBBY_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_capacity),
            session: SessionConfig {
                min_players: std::env::var("MIN_PLAYERS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.session.min_players),
                host_succession: std::env::var("HOST_SUCCESSION")
                    .ok()
                    .and_then(|v| HostSuccession::parse(&v))
                    .unwrap_or(defaults.session.host_succession),
                transfer_host_on_disconnect: std::env::var("TRANSFER_HOST_ON_DISCONNECT")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(defaults.session.transfer_host_on_disconnect),
            },
        }
    }
}

// =============================================================================
// LOBBY
// =============================================================================

/// Request to create a lobby.
#[derive(Debug, Clone)]
pub struct NewLobby {
    /// Display name.
    pub name: String,
    /// Maximum members.
    pub capacity: usize,
    /// Game played in the lobby.
    pub rules: Arc<dyn GameRules>,
}

/// Externally visible lobby status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyStatus {
    /// Accepting members.
    Open,
    /// Game running.
    InProgress,
    /// Game over or closed.
    Closed,
}

/// Lobby listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbySummary {
    /// Lobby id.
    pub lobby_id: LobbyId,
    /// Display name.
    pub name: String,
    /// Game name.
    pub game: String,
    /// Current host.
    pub host: IdentityId,
    /// Member count.
    pub members: usize,
    /// Capacity.
    pub capacity: usize,
    /// Status.
    pub status: LobbyStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A lobby and its session.
#[derive(Debug)]
pub struct Lobby {
    id: LobbyId,
    name: String,
    creator: IdentityId,
    capacity: usize,
    created_at: DateTime<Utc>,
    session: Session,
    removed: bool,
}

impl Lobby {
    /// Lobby id.
    pub fn id(&self) -> LobbyId {
        self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Who created it.
    pub fn creator(&self) -> IdentityId {
        self.creator
    }

    /// Capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Status derived from the session.
    pub fn status(&self) -> LobbyStatus {
        if self.removed || self.session.is_closed() {
            return LobbyStatus::Closed;
        }
        match self.session.phase() {
            Phase::Waiting => LobbyStatus::Open,
            Phase::Active => LobbyStatus::InProgress,
            Phase::Finished => LobbyStatus::Closed,
        }
    }

    /// Whether new members are accepted.
    pub fn is_open(&self) -> bool {
        self.status() == LobbyStatus::Open
    }

    /// Listing entry.
    pub fn summary(&self) -> LobbySummary {
        LobbySummary {
            lobby_id: self.id,
            name: self.name.clone(),
            game: self.session.rules().name().to_string(),
            host: self.session.host(),
            members: self.session.members().len(),
            capacity: self.capacity,
            status: self.status(),
            created_at: self.created_at,
        }
    }

    fn should_destroy(&self) -> bool {
        self.session.is_closed() || self.session.members().is_empty()
    }
}

/// Lazy, restartable view of the open lobbies.
///
/// The set of lobbies is fixed when the listing is taken; each summary is
/// read when the stream reaches it, and lobbies that stopped being open by
/// then are skipped.
pub struct LobbyListing {
    handles: Vec<Arc<Mutex<Lobby>>>,
}

impl LobbyListing {
    /// Number of lobbies captured (open or not).
    pub fn captured(&self) -> usize {
        self.handles.len()
    }

    /// Stream the summaries. May be called any number of times.
    pub fn stream(&self) -> impl Stream<Item = LobbySummary> + '_ {
        stream::iter(self.handles.iter()).filter_map(|handle| async move {
            let lobby = handle.lock().await;
            let summary = if lobby.is_open() { Some(lobby.summary()) } else { None };
            summary
        })
    }

    /// Collect the summaries.
    pub async fn collect(&self) -> Vec<LobbySummary> {
        self.stream().collect().await
    }
}

/// Result of an invariant check over all lobbies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Live lobbies.
    pub lobbies: usize,
    /// Members across all lobbies.
    pub members: usize,
    /// Violations found, empty when healthy.
    pub violations: Vec<String>,
}

impl HealthReport {
    /// Whether no violations were found.
    pub fn is_healthy(&self) -> bool {
        self.violations.is_empty()
    }
}

// =============================================================================
// STORE
// =============================================================================

/// All lobbies.
pub struct LobbyStore {
    config: LobbyConfig,
    dispatcher: Arc<BroadcastDispatcher>,
    lobbies: RwLock<BTreeMap<LobbyId, Arc<Mutex<Lobby>>>>,
    membership: Mutex<BTreeMap<IdentityId, LobbyId>>,
    observed: Mutex<BTreeMap<LobbyId, u64>>,
}

impl LobbyStore {
    /// Create an empty store publishing through `dispatcher`.
    pub fn new(config: LobbyConfig, dispatcher: Arc<BroadcastDispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            lobbies: RwLock::new(BTreeMap::new()),
            membership: Mutex::new(BTreeMap::new()),
            observed: Mutex::new(BTreeMap::new()),
        }
    }

    /// Store configuration.
    pub fn config(&self) -> &LobbyConfig {
        &self.config
    }

    /// Create a lobby with `host` as its first member.
    ///
    /// `subscriber` (or, when `None`, the host's current connection) is
    /// subscribed to the lobby and sent the initial snapshot.
    #[instrument(skip(self, host, request), fields(host = %host.id.short()))]
    pub async fn create_lobby(
        &self,
        host: Identity,
        request: NewLobby,
        subscriber: Option<ConnectionId>,
    ) -> Result<SessionSnapshot, SessionError> {
        let too_many = request.rules.max_players().map_or(false, |max| request.capacity > max);
        if request.capacity <= 1 || request.capacity > self.config.max_capacity || too_many {
            return Err(SessionError::CapacityInvalid(request.capacity));
        }

        let lobby_id = LobbyId::generate();
        let host_id = host.id;
        self.reserve(host_id, lobby_id).await?;
        let subscriber = match subscriber {
            Some(connection_id) => Some(connection_id),
            None => self.dispatcher.connection_of(&host_id).await,
        };

        let lobby = Lobby {
            id: lobby_id,
            name: request.name,
            creator: host_id,
            capacity: request.capacity,
            created_at: Utc::now(),
            session: Session::new(lobby_id, host, request.rules, self.config.session.clone()),
            removed: false,
        };
        let handle = Arc::new(Mutex::new(lobby));
        let lobby = handle.lock().await;

        self.lobbies.write().await.insert(lobby_id, handle.clone());

        let snapshot = lobby.session.snapshot();
        if let Some(connection_id) = subscriber {
            self.dispatcher
                .attach(lobby_id, connection_id, ServerMessage::Snapshot(snapshot.clone()))
                .await;
        }
        self.dispatcher
            .publish_directory(DirectoryEvent::LobbyOpened(lobby.summary()))
            .await;

        info!(
            "Lobby {} created ({}, capacity {})",
            lobby_id.short(),
            lobby.session.rules().name(),
            lobby.capacity
        );
        Ok(snapshot)
    }

    /// Add `identity` to a lobby and return the snapshot it starts from.
    ///
    /// `subscriber`, or the identity's current connection when `None`, is
    /// subscribed and handed the snapshot.
    #[instrument(skip(self, identity), fields(lobby = %lobby_id.short(), identity = %identity.id.short()))]
    pub async fn join(
        &self,
        lobby_id: LobbyId,
        identity: Identity,
        subscriber: Option<ConnectionId>,
    ) -> Result<SessionSnapshot, SessionError> {
        let handle = self.handle(lobby_id).await.ok_or(SessionError::LobbyNotFound)?;
        let identity_id = identity.id;
        self.reserve(identity_id, lobby_id).await?;

        let mut lobby = handle.lock().await;
        let admitted = if lobby.removed {
            Err(SessionError::LobbyNotFound)
        } else if lobby.session.members().len() >= lobby.capacity {
            Err(SessionError::LobbyFull)
        } else {
            lobby.session.add_member(identity)
        };

        let event = match admitted {
            Ok(event) => event,
            Err(e) => {
                self.release(&identity_id, lobby_id).await;
                return Err(e);
            }
        };

        self.broadcast(&mut lobby, vec![event]).await?;

        let subscriber = match subscriber {
            Some(connection_id) => Some(connection_id),
            None => self.dispatcher.connection_of(&identity_id).await,
        };
        let snapshot = lobby.session.snapshot();
        if let Some(connection_id) = subscriber {
            self.dispatcher
                .attach(lobby_id, connection_id, ServerMessage::Snapshot(snapshot.clone()))
                .await;
        }
        self.dispatcher
            .publish_directory(DirectoryEvent::LobbyUpdated(lobby.summary()))
            .await;

        debug!("Joined ({} members)", lobby.session.members().len());
        Ok(snapshot)
    }

    /// Remove `identity_id` from a lobby. Leaving a lobby one is not in,
    /// or one that no longer exists, is a no-op.
    #[instrument(skip(self), fields(lobby = %lobby_id.short(), identity = %identity_id.short()))]
    pub async fn leave(
        &self,
        lobby_id: LobbyId,
        identity_id: &IdentityId,
        reason: LeaveReason,
        subscriber: Option<ConnectionId>,
    ) -> Result<(), SessionError> {
        let Some(handle) = self.handle(lobby_id).await else {
            return Ok(());
        };
        let mut lobby = handle.lock().await;
        if lobby.removed {
            return Ok(());
        }

        if let Some(connection_id) = subscriber {
            self.dispatcher.unsubscribe(lobby_id, connection_id).await;
        }

        let events = match lobby.session.remove_member(identity_id, reason) {
            Ok(events) => events,
            Err(e) => {
                self.release(identity_id, lobby_id).await;
                self.fail_locked(&mut lobby, e.to_string()).await;
                return Err(e);
            }
        };
        if events.is_empty() {
            return Ok(());
        }
        self.release(identity_id, lobby_id).await;

        // Whatever socket the member has stops hearing the lobby
        if let Some(connection_id) = self.dispatcher.connection_of(identity_id).await {
            self.dispatcher.unsubscribe(lobby_id, connection_id).await;
        }

        self.broadcast(&mut lobby, events).await?;

        if lobby.should_destroy() {
            self.destroy_locked(&mut lobby).await;
        } else {
            self.dispatcher
                .publish_directory(DirectoryEvent::LobbyUpdated(lobby.summary()))
                .await;
        }

        debug!("Left ({:?})", reason);
        Ok(())
    }

    /// Apply a command and broadcast the resulting event.
    ///
    /// With `origin` set, the command is dropped (`Cancelled`) if that socket
    /// is no longer the attached one by the time the lobby lock is held.
    pub async fn apply_command(
        &self,
        lobby_id: LobbyId,
        issuer: &IdentityId,
        command: SessionCommand,
        origin: Option<Attachment>,
    ) -> Result<SessionEvent, SessionError> {
        let handle = self.handle(lobby_id).await.ok_or(SessionError::LobbyNotFound)?;
        let mut lobby = handle.lock().await;
        if lobby.removed {
            return Err(SessionError::LobbyNotFound);
        }

        if let Some(attachment) = origin {
            if !self.dispatcher.is_current(attachment).await {
                debug!(
                    "Dropping {} from stale {} (generation {})",
                    command.name(),
                    attachment.connection_id.short(),
                    attachment.generation
                );
                return Err(SessionError::Cancelled);
            }
        }

        let status_before = lobby.status();
        let event = match lobby.session.apply_command(issuer, command) {
            Ok(event) => event,
            Err(SessionError::Internal(detail)) => {
                self.fail_locked(&mut lobby, detail.clone()).await;
                return Err(SessionError::Internal(detail));
            }
            Err(e) => return Err(e),
        };

        self.broadcast(&mut lobby, vec![event.clone()]).await?;

        if lobby.should_destroy() {
            self.destroy_locked(&mut lobby).await;
        } else if lobby.status() != status_before {
            self.dispatcher
                .publish_directory(DirectoryEvent::LobbyUpdated(lobby.summary()))
                .await;
        }

        Ok(event)
    }

    /// Record a member's connection dropping or coming back.
    pub async fn set_presence(&self, lobby_id: LobbyId, identity_id: &IdentityId, connected: bool) -> Result<(), SessionError> {
        let handle = self.handle(lobby_id).await.ok_or(SessionError::LobbyNotFound)?;
        let mut lobby = handle.lock().await;
        if lobby.removed {
            return Err(SessionError::LobbyNotFound);
        }

        match lobby.session.set_presence(identity_id, connected) {
            Ok(events) => self.broadcast(&mut lobby, events).await,
            Err(e) => {
                self.fail_locked(&mut lobby, e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Mark a member connected, subscribe `connection_id` and send it a
    /// fresh snapshot, all under the lobby lock.
    pub async fn resync(
        &self,
        lobby_id: LobbyId,
        identity_id: &IdentityId,
        connection_id: ConnectionId,
    ) -> Result<SessionSnapshot, SessionError> {
        let handle = self.handle(lobby_id).await.ok_or(SessionError::LobbyNotFound)?;
        let mut lobby = handle.lock().await;
        if lobby.removed {
            return Err(SessionError::LobbyNotFound);
        }
        if !lobby.session.is_member(identity_id) {
            return Err(SessionError::NotAMember);
        }

        match lobby.session.set_presence(identity_id, true) {
            Ok(events) => self.broadcast(&mut lobby, events).await?,
            Err(e) => {
                self.fail_locked(&mut lobby, e.to_string()).await;
                return Err(e);
            }
        }

        let snapshot = lobby.session.snapshot();
        self.dispatcher
            .attach(lobby_id, connection_id, ServerMessage::Snapshot(snapshot.clone()))
            .await;
        Ok(snapshot)
    }

    /// Current snapshot of a lobby.
    pub async fn snapshot(&self, lobby_id: LobbyId) -> Result<SessionSnapshot, SessionError> {
        let handle = self.handle(lobby_id).await.ok_or(SessionError::LobbyNotFound)?;
        let lobby = handle.lock().await;
        if lobby.removed {
            return Err(SessionError::LobbyNotFound);
        }
        Ok(lobby.session.snapshot())
    }

    /// Summary of one lobby.
    pub async fn summary(&self, lobby_id: LobbyId) -> Option<LobbySummary> {
        let handle = self.handle(lobby_id).await?;
        let lobby = handle.lock().await;
        if lobby.removed {
            return None;
        }
        Some(lobby.summary())
    }

    /// Open lobbies, read lazily.
    pub async fn list_open_lobbies(&self) -> LobbyListing {
        LobbyListing {
            handles: self.lobbies.read().await.values().cloned().collect(),
        }
    }

    /// Lobby an identity belongs to.
    pub async fn lobby_of(&self, identity_id: &IdentityId) -> Option<LobbyId> {
        self.membership.lock().await.get(identity_id).copied()
    }

    /// Number of live lobbies.
    pub async fn lobby_count(&self) -> usize {
        self.lobbies.read().await.len()
    }

    /// Destroy lobbies that are closed or empty. Returns how many.
    pub async fn cleanup(&self) -> usize {
        let handles: Vec<_> = self.lobbies.read().await.values().cloned().collect();
        let mut removed = 0;

        for handle in handles {
            let mut lobby = handle.lock().await;
            if !lobby.removed && lobby.should_destroy() {
                self.destroy_locked(&mut lobby).await;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Cleaned up {} lobbies", removed);
        }
        removed
    }

    /// Check cross-lobby invariants.
    pub async fn health(&self) -> HealthReport {
        let handles: Vec<_> = self.lobbies.read().await.iter().map(|(id, h)| (*id, h.clone())).collect();
        let mut report = HealthReport::default();
        let mut seen: BTreeMap<IdentityId, LobbyId> = BTreeMap::new();

        for (lobby_id, handle) in handles {
            let lobby = handle.lock().await;
            if lobby.removed {
                continue;
            }
            report.lobbies += 1;
            report.members += lobby.session.members().len();

            for problem in lobby.session.check_invariants(lobby.capacity) {
                report.violations.push(format!("lobby {}: {}", lobby_id.short(), problem));
            }

            let sequence = lobby.session.sequence();
            {
                let mut observed = self.observed.lock().await;
                let last = observed.entry(lobby_id).or_insert(sequence);
                if sequence < *last {
                    report.violations.push(format!(
                        "lobby {}: sequence went from {} to {}",
                        lobby_id.short(),
                        last,
                        sequence
                    ));
                }
                *last = sequence;
            }

            for id in lobby.session.member_ids() {
                if let Some(other) = seen.insert(id, lobby_id) {
                    report.violations.push(format!(
                        "identity {} is in lobbies {} and {}",
                        id.short(),
                        other.short(),
                        lobby_id.short()
                    ));
                }
            }
        }

        if !report.is_healthy() {
            warn!("Health check found {} violations", report.violations.len());
        }
        report
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    async fn handle(&self, lobby_id: LobbyId) -> Option<Arc<Mutex<Lobby>>> {
        self.lobbies.read().await.get(&lobby_id).cloned()
    }

    async fn reserve(&self, identity_id: IdentityId, lobby_id: LobbyId) -> Result<(), SessionError> {
        let mut membership = self.membership.lock().await;
        if membership.contains_key(&identity_id) {
            return Err(SessionError::AlreadyInLobby);
        }
        membership.insert(identity_id, lobby_id);
        Ok(())
    }

    async fn release(&self, identity_id: &IdentityId, lobby_id: LobbyId) {
        let mut membership = self.membership.lock().await;
        if membership.get(identity_id) == Some(&lobby_id) {
            membership.remove(identity_id);
        }
    }

    /// Publish events in order. A dispatch failure fails the lobby and is
    /// returned as `Internal`.
    async fn broadcast(&self, lobby: &mut Lobby, events: Vec<SessionEvent>) -> Result<(), SessionError> {
        for event in events {
            if let Err(e) = self.dispatcher.publish(&event).await {
                error!("{}", e);
                self.fail_locked(lobby, e.to_string()).await;
                return Err(SessionError::Internal(e.to_string()));
            }
        }
        Ok(())
    }

    /// Fail one lobby: notify members and destroy it. Other lobbies are
    /// unaffected.
    async fn fail_locked(&self, lobby: &mut Lobby, detail: String) {
        error!("Lobby {} failed: {}", lobby.id.short(), detail);
        if let Some(event) = lobby.session.fail(detail) {
            let delivery = self.dispatcher.publish_closing(&event).await;
            if delivery.dropped > 0 {
                warn!("Failure of {} missed {} members", lobby.id.short(), delivery.dropped);
            }
        }
        self.destroy_locked(lobby).await;
    }

    async fn destroy_locked(&self, lobby: &mut Lobby) {
        if lobby.removed {
            return;
        }
        lobby.removed = true;
        self.lobbies.write().await.remove(&lobby.id);

        {
            let mut membership = self.membership.lock().await;
            for id in lobby.session.member_ids() {
                if membership.get(&id) == Some(&lobby.id) {
                    membership.remove(&id);
                }
            }
        }
        self.observed.lock().await.remove(&lobby.id);

        self.dispatcher.drop_topic(lobby.id).await;
        self.dispatcher
            .publish_directory(DirectoryEvent::LobbyRemoved { lobby_id: lobby.id })
            .await;

        let reason = match lobby.session.close_reason() {
            Some(reason) => format!("{:?}", reason),
            None => "empty".to_string(),
        };
        info!("Lobby {} destroyed ({})", lobby.id.short(), reason);
    }
}

/// Whether an event ends the lobby's life.
pub fn is_closing(event: &SessionEvent) -> bool {
    matches!(event.kind, EventKind::LobbyClosed(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{RaceRules, TicTacToeRules};
    use crate::lobby::events::CloseReason;
    use crate::network::registry::ConnectionRegistry;
    use proptest::prelude::*;
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn identity(n: u8) -> Identity {
        Identity::new(IdentityId::from_bytes([n; 16]), format!("player-{}", n))
    }

    fn store() -> (LobbyStore, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::default());
        let dispatcher = Arc::new(BroadcastDispatcher::new(registry.clone()));
        (LobbyStore::new(LobbyConfig::default(), dispatcher), registry)
    }

    fn race(capacity: usize) -> NewLobby {
        NewLobby {
            name: "table".into(),
            capacity,
            rules: Arc::new(RaceRules::default()),
        }
    }

    #[tokio::test]
    async fn test_capacity_validation() {
        let (store, _) = store();
        for capacity in [0, 1, DEFAULT_MAX_CAPACITY + 1] {
            let err = store.create_lobby(identity(1), race(capacity), None).await.unwrap_err();
            assert_eq!(err, SessionError::CapacityInvalid(capacity));
        }

        let request = NewLobby {
            name: "ttt".into(),
            capacity: 3,
            rules: Arc::new(TicTacToeRules),
        };
        assert!(matches!(
            store.create_lobby(identity(1), request, None).await,
            Err(SessionError::CapacityInvalid(3))
        ));

        // Failed creation leaves no reservation behind
        assert!(store.lobby_of(&identity(1).id).await.is_none());
        assert_eq!(store.lobby_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_errors() {
        let (store, _) = store();
        let snapshot = store.create_lobby(identity(1), race(2), None).await.unwrap();
        let lobby_id = snapshot.lobby_id;
        assert_eq!(snapshot.members.len(), 1);
        assert_eq!(snapshot.host, identity(1).id);

        let err = store.join(LobbyId::generate(), identity(2), None).await.unwrap_err();
        assert_eq!(err, SessionError::LobbyNotFound);

        let err = store.join(lobby_id, identity(1), None).await.unwrap_err();
        assert_eq!(err, SessionError::AlreadyInLobby);

        store.join(lobby_id, identity(2), None).await.unwrap();
        let err = store.join(lobby_id, identity(3), None).await.unwrap_err();
        assert_eq!(err, SessionError::LobbyFull);
        assert!(store.lobby_of(&identity(3).id).await.is_none());
    }

    #[tokio::test]
    async fn test_member_in_at_most_one_lobby() {
        let (store, _) = store();
        let first = store.create_lobby(identity(1), race(4), None).await.unwrap();
        let second = store.create_lobby(identity(2), race(4), None).await.unwrap();

        store.join(first.lobby_id, identity(3), None).await.unwrap();
        let err = store.join(second.lobby_id, identity(3), None).await.unwrap_err();
        assert_eq!(err, SessionError::AlreadyInLobby);

        store
            .leave(first.lobby_id, &identity(3).id, LeaveReason::Left, None)
            .await
            .unwrap();
        store.join(second.lobby_id, identity(3), None).await.unwrap();
        assert_eq!(store.lobby_of(&identity(3).id).await, Some(second.lobby_id));
    }

    #[tokio::test]
    async fn test_leave_is_idempotent_and_empty_lobby_is_destroyed() {
        let (store, _) = store();
        let lobby_id = store.create_lobby(identity(1), race(2), None).await.unwrap().lobby_id;

        store.leave(lobby_id, &identity(1).id, LeaveReason::Left, None).await.unwrap();
        store.leave(lobby_id, &identity(1).id, LeaveReason::Left, None).await.unwrap();

        assert_eq!(store.lobby_count().await, 0);
        assert_eq!(store.snapshot(lobby_id).await.unwrap_err(), SessionError::LobbyNotFound);
        assert!(store.lobby_of(&identity(1).id).await.is_none());
    }

    #[tokio::test]
    async fn test_listing_is_lazy_and_restartable() {
        let (store, _) = store();
        let a = store.create_lobby(identity(1), race(2), None).await.unwrap().lobby_id;
        let b = store.create_lobby(identity(2), race(2), None).await.unwrap().lobby_id;

        let listing = store.list_open_lobbies().await;
        assert_eq!(listing.captured(), 2);

        // Lobby a fills up and starts after the listing was taken
        store.join(a, identity(3), None).await.unwrap();
        store
            .apply_command(a, &identity(1).id, SessionCommand::Start, None)
            .await
            .unwrap();

        let first = listing.collect().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].lobby_id, b);

        // A lobby created later is not part of this listing
        store.create_lobby(identity(4), race(2), None).await.unwrap();
        let again = listing.collect().await;
        assert_eq!(again, first);
        assert_eq!(store.list_open_lobbies().await.collect().await.len(), 2);
    }

    #[tokio::test]
    async fn test_close_destroys_lobby_and_frees_members() {
        let (store, _) = store();
        let lobby_id = store.create_lobby(identity(1), race(4), None).await.unwrap().lobby_id;
        store.join(lobby_id, identity(2), None).await.unwrap();

        let event = store
            .apply_command(lobby_id, &identity(1).id, SessionCommand::Close, None)
            .await
            .unwrap();
        assert!(is_closing(&event));
        assert_eq!(store.lobby_count().await, 0);
        assert!(store.lobby_of(&identity(2).id).await.is_none());
    }

    #[tokio::test]
    async fn test_subscriber_gets_snapshot_then_events() {
        let (store, registry) = store();
        let (tx, mut rx) = mpsc::channel(16);
        let conn = registry.register(tx, identity(1), Instant::now()).await.connection_id;

        let lobby_id = store
            .create_lobby(identity(1), race(2), Some(conn))
            .await
            .unwrap()
            .lobby_id;
        store.join(lobby_id, identity(2), None).await.unwrap();

        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Snapshot(s)) if s.sequence == 0));
        match rx.try_recv() {
            Ok(ServerMessage::Event(e)) => assert!(matches!(e.kind, EventKind::MemberJoined(_))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_detached_origin_is_cancelled() {
        let (store, registry) = store();
        let (tx, _rx) = mpsc::channel(16);
        let attachment = registry.register(tx, identity(1), Instant::now()).await;
        let conn = attachment.connection_id;

        let lobby_id = store.create_lobby(identity(1), race(2), Some(conn)).await.unwrap().lobby_id;
        store.join(lobby_id, identity(2), None).await.unwrap();

        registry.mark_disconnected(conn, attachment.generation, Instant::now()).await;
        let err = store
            .apply_command(lobby_id, &identity(1).id, SessionCommand::Start, Some(attachment))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Cancelled);
        assert_eq!(store.snapshot(lobby_id).await.unwrap().phase, Phase::Waiting);
    }

    #[tokio::test]
    async fn test_superseded_socket_is_cancelled() {
        let (store, registry) = store();
        let (tx, _rx) = mpsc::channel(16);
        let first = registry.register(tx, identity(1), Instant::now()).await;

        let lobby_id = store
            .create_lobby(identity(1), race(2), Some(first.connection_id))
            .await
            .unwrap()
            .lobby_id;
        store.join(lobby_id, identity(2), None).await.unwrap();

        let (tx2, _rx2) = mpsc::channel(16);
        let second = registry
            .reconnect(first.connection_id, tx2, Instant::now())
            .await
            .unwrap();

        let err = store
            .apply_command(lobby_id, &identity(1).id, SessionCommand::Start, Some(first))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Cancelled);

        store
            .apply_command(lobby_id, &identity(1).id, SessionCommand::Start, Some(second))
            .await
            .unwrap();
        assert_eq!(store.snapshot(lobby_id).await.unwrap().phase, Phase::Active);
    }

    #[tokio::test]
    async fn test_membership_drives_subscription_without_explicit_subscriber() {
        let (store, registry) = store();
        let (tx1, mut rx1) = mpsc::channel(16);
        registry.register(tx1, identity(1), Instant::now()).await;
        let (tx2, mut rx2) = mpsc::channel(16);
        let conn2 = registry.register(tx2, identity(2), Instant::now()).await.connection_id;

        let lobby_id = store.create_lobby(identity(1), race(3), None).await.unwrap().lobby_id;
        assert!(matches!(rx1.try_recv(), Ok(ServerMessage::Snapshot(_))));

        store.join(lobby_id, identity(2), None).await.unwrap();
        assert!(matches!(rx2.try_recv(), Ok(ServerMessage::Snapshot(s)) if s.members.len() == 2));
        assert!(store.dispatcher.subscribers(lobby_id).await.contains(&conn2));

        store
            .leave(lobby_id, &identity(2).id, LeaveReason::Left, None)
            .await
            .unwrap();
        assert!(!store.dispatcher.subscribers(lobby_id).await.contains(&conn2));

        store.join(lobby_id, identity(3), None).await.unwrap();
        store
            .apply_command(lobby_id, &identity(1).id, SessionCommand::Start, None)
            .await
            .unwrap();
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_failure_fails_only_that_lobby() {
        let (store, registry) = store();
        let mut outboxes = Vec::new();
        for n in 1..=3 {
            let (tx, rx) = mpsc::channel(16);
            registry.register(tx, identity(n), Instant::now()).await;
            outboxes.push(rx);
        }

        let failing = store.create_lobby(identity(1), race(2), None).await.unwrap().lobby_id;
        store.join(failing, identity(2), None).await.unwrap();
        let healthy = store.create_lobby(identity(3), race(2), None).await.unwrap().lobby_id;
        store.join(healthy, identity(4), None).await.unwrap();

        // A stray event far ahead makes the next publish a regression
        store
            .dispatcher
            .publish(&SessionEvent::new(failing, 100, EventKind::PhaseChanged(Phase::Active)))
            .await
            .unwrap();

        let err = store
            .apply_command(failing, &identity(1).id, SessionCommand::Start, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Internal(_)));

        for rx in outboxes.iter_mut().take(2) {
            let last = std::iter::from_fn(|| rx.try_recv().ok()).last();
            match last {
                Some(ServerMessage::Event(e)) => {
                    assert!(matches!(e.kind, EventKind::LobbyClosed(CloseReason::Failed { .. })), "{:?}", e.kind)
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(store.lobby_count().await, 1);
        assert!(store.lobby_of(&identity(1).id).await.is_none());
        assert!(store.lobby_of(&identity(2).id).await.is_none());
        assert_eq!(store.snapshot(failing).await.unwrap_err(), SessionError::LobbyNotFound);

        store
            .apply_command(healthy, &identity(3).id, SessionCommand::Start, None)
            .await
            .unwrap();
        let last = std::iter::from_fn(|| outboxes[2].try_recv().ok()).last();
        assert!(matches!(
            last,
            Some(ServerMessage::Event(SessionEvent { kind: EventKind::PhaseChanged(Phase::Active), .. }))
        ));
        assert!(store.health().await.is_healthy());
    }

    #[tokio::test]
    async fn test_health_reports_clean_store() {
        let (store, _) = store();
        let lobby_id = store.create_lobby(identity(1), race(3), None).await.unwrap().lobby_id;
        store.join(lobby_id, identity(2), None).await.unwrap();
        store.create_lobby(identity(3), race(3), None).await.unwrap();

        let report = store.health().await;
        assert!(report.is_healthy(), "{:?}", report.violations);
        assert_eq!(report.lobbies, 2);
        assert_eq!(report.members, 3);
        assert_eq!(store.cleanup().await, 0);
    }

    proptest! {
        #[test]
        fn prop_random_joins_and_leaves_stay_healthy(
            ops in proptest::collection::vec((any::<bool>(), 0u8..6, 0usize..2), 0..40)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let (store, _) = store();
                let lobbies = [
                    store.create_lobby(identity(100), race(3), None).await.unwrap().lobby_id,
                    store.create_lobby(identity(101), race(3), None).await.unwrap().lobby_id,
                ];

                for (joining, who, which) in ops {
                    let lobby_id = lobbies[which];
                    if joining {
                        let _ = store.join(lobby_id, identity(who), None).await;
                    } else {
                        let _ = store.leave(lobby_id, &identity(who).id, LeaveReason::Left, None).await;
                    }

                    let report = store.health().await;
                    prop_assert!(report.is_healthy(), "{:?}", report.violations);
                    for lobby_id in lobbies {
                        if let Ok(snapshot) = store.snapshot(lobby_id).await {
                            prop_assert!(snapshot.members.len() <= 3);
                            let ids: std::collections::BTreeSet<_> =
                                snapshot.members.iter().map(|m| m.identity.id).collect();
                            prop_assert_eq!(ids.len(), snapshot.members.len());
                            for id in ids {
                                prop_assert_eq!(store.lobby_of(&id).await, Some(lobby_id));
                            }
                        }
                    }
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
