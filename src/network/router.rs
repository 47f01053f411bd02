//! Command Router
//!
//! Single ingress for client traffic. Resolves the caller's identity from
//! the connection registry, validates the request's shape, and hands it to
//! the lobby store. Accepted commands are answered by the broadcast they
//! cause; only failures (and direct queries) are replied to the sender.
//!
//! Also owns connection lifecycle glue: connect/resume, disconnect into the
//! grace period, and the sweep that evicts expired connections.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::core::ids::{ConnectionId, Identity, IdentityId, LobbyId};
use crate::game::GameCatalog;
use crate::lobby::events::{LeaveReason, SessionEvent};
use crate::lobby::session::{SessionCommand, SessionError, SessionSnapshot};
use crate::lobby::store::{HealthReport, LobbyConfig, LobbyStore, LobbySummary, NewLobby};
use crate::network::dispatcher::BroadcastDispatcher;
use crate::network::protocol::{ClientMessage, Outbox, ServerMessage};
use crate::network::registry::{Attachment, ConnectionRegistry};

/// Longest accepted lobby name.
pub const MAX_LOBBY_NAME: usize = 64;

/// Result of attaching a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    /// Connection id and generation.
    pub attachment: Attachment,
    /// Whether an earlier connection was resumed.
    pub resumed: bool,
}

/// Routes client messages to the lobby layer.
pub struct CommandRouter {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<BroadcastDispatcher>,
    store: Arc<LobbyStore>,
    catalog: GameCatalog,
}

impl CommandRouter {
    /// Wire up a router from its parts.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<BroadcastDispatcher>,
        store: Arc<LobbyStore>,
        catalog: GameCatalog,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            store,
            catalog,
        }
    }

    /// Build registry, dispatcher and store from configuration.
    pub fn with_config(lobby: LobbyConfig, grace_period: Duration, catalog: GameCatalog) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(grace_period));
        let dispatcher = Arc::new(BroadcastDispatcher::new(registry.clone()));
        let store = Arc::new(LobbyStore::new(lobby, dispatcher.clone()));
        Self::new(registry, dispatcher, store, catalog)
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Lobby store.
    pub fn store(&self) -> &Arc<LobbyStore> {
        &self.store
    }

    /// Game catalog.
    pub fn catalog(&self) -> &GameCatalog {
        &self.catalog
    }

    // =========================================================================
    // CONNECTION LIFECYCLE
    // =========================================================================

    /// Attach an authenticated socket.
    ///
    /// With a `resume` token the earlier connection is re-attached if it is
    /// still inside its grace period. An identity that already has a live or
    /// recoverable connection takes it over as well. In both cases lobby
    /// membership carries over and the client is sent a fresh snapshot.
    /// Otherwise a new connection is registered.
    #[instrument(skip(self, identity, outbox), fields(identity = %identity.id.short()))]
    pub async fn connect(
        &self,
        identity: Identity,
        resume: Option<ConnectionId>,
        outbox: Outbox,
        now: Instant,
    ) -> Result<Connected, SessionError> {
        if let Some(connection_id) = resume {
            match self.registry.identity(connection_id).await {
                Some(owner) if owner.id != identity.id => {
                    return Err(SessionError::NotAuthorized("resume token belongs to another identity"));
                }
                Some(_) => {
                    if let Some(attachment) = self.registry.reconnect(connection_id, outbox.clone(), now).await {
                        self.reattach(&identity.id, connection_id).await;
                        return Ok(Connected { attachment, resumed: true });
                    }
                }
                None => debug!("Resume token {} is unknown or expired", connection_id.short()),
            }
        }

        if let Some(existing) = self.registry.connection_of(&identity.id).await {
            if let Some(attachment) = self.registry.reconnect(existing, outbox.clone(), now).await {
                self.reattach(&identity.id, existing).await;
                return Ok(Connected { attachment, resumed: true });
            }
            // Past its deadline but not yet swept
            self.expire(existing).await;
        }

        let attachment = self.registry.register(outbox, identity, now).await;
        Ok(Connected {
            attachment,
            resumed: false,
        })
    }

    /// The socket behind `attachment` closed. Starts the grace period and
    /// marks the member offline in its lobby.
    pub async fn disconnect(&self, attachment: Attachment, now: Instant) -> bool {
        let connection_id = attachment.connection_id;
        if !self
            .registry
            .mark_disconnected(connection_id, attachment.generation, now)
            .await
        {
            return false;
        }

        if let Some(identity) = self.registry.identity(connection_id).await {
            if let Some(lobby_id) = self.store.lobby_of(&identity.id).await {
                if let Err(e) = self.store.set_presence(lobby_id, &identity.id, false).await {
                    debug!("Presence update for {} failed: {}", identity.id.short(), e);
                }
            }
        }
        true
    }

    /// Evict connections whose grace period has run out. Their members
    /// leave their lobbies with reason `timed_out`.
    pub async fn sweep(&self, now: Instant) -> usize {
        let expired = self.registry.expired(now).await;
        for connection_id in &expired {
            self.expire(*connection_id).await;
        }
        expired.len()
    }

    async fn expire(&self, connection_id: ConnectionId) {
        let Some(identity) = self.registry.evict(connection_id).await else {
            return;
        };
        self.dispatcher.unsubscribe_all(connection_id).await;

        if let Some(lobby_id) = self.store.lobby_of(&identity.id).await {
            if let Err(e) = self
                .store
                .leave(lobby_id, &identity.id, LeaveReason::TimedOut, None)
                .await
            {
                warn!("Timed-out leave of {} failed: {}", identity.id.short(), e);
            }
        }
    }

    async fn reattach(&self, identity_id: &IdentityId, connection_id: ConnectionId) {
        if let Some(lobby_id) = self.store.lobby_of(identity_id).await {
            match self.store.resync(lobby_id, identity_id, connection_id).await {
                Ok(snapshot) => info!(
                    "Connection {} back in lobby {} at seq {}",
                    connection_id.short(),
                    lobby_id.short(),
                    snapshot.sequence
                ),
                Err(e) => debug!("Resync after resume failed: {}", e),
            }
        }
    }

    // =========================================================================
    // MESSAGE HANDLING
    // =========================================================================

    /// Handle one message from an authenticated connection.
    ///
    /// `Ok(Some(..))` is a direct reply for the sender; `Ok(None)` means the
    /// outcome was already delivered through the connection's outbox.
    /// Frames from a socket that has since been superseded are `Cancelled`.
    pub async fn handle(
        &self,
        attachment: Attachment,
        message: ClientMessage,
        now: Instant,
    ) -> Result<Option<ServerMessage>, SessionError> {
        let connection_id = attachment.connection_id;
        let identity = self
            .registry
            .identity(connection_id)
            .await
            .ok_or(SessionError::NotAuthenticated)?;
        if !self.registry.is_current(attachment).await {
            return Err(SessionError::Cancelled);
        }
        self.registry.touch(connection_id, now).await;

        match message {
            ClientMessage::Auth(_) => Err(SessionError::IllegalCommand("already authenticated".into())),

            ClientMessage::ListLobbies => Ok(Some(ServerMessage::Lobbies {
                lobbies: self.list_lobbies().await,
            })),

            ClientMessage::CreateLobby { name, game, capacity } => {
                self.create_lobby(identity, name, &game, capacity, Some(connection_id))
                    .await?;
                Ok(None)
            }

            ClientMessage::JoinLobby { lobby_id } => {
                self.join_lobby(lobby_id, identity, Some(connection_id)).await?;
                Ok(None)
            }

            ClientMessage::LeaveLobby { lobby_id } => {
                self.leave_lobby(lobby_id, &identity.id, Some(connection_id)).await?;
                Ok(Some(ServerMessage::Left { lobby_id }))
            }

            ClientMessage::Command { lobby_id, command } => {
                validate_command(&identity.id, &command)?;
                self.store
                    .apply_command(lobby_id, &identity.id, command, Some(attachment))
                    .await?;
                Ok(None)
            }

            ClientMessage::SyncRequest { lobby_id } => {
                self.store.resync(lobby_id, &identity.id, connection_id).await?;
                Ok(None)
            }

            ClientMessage::WatchLobbies => {
                self.dispatcher.watch_directory(connection_id).await;
                Ok(Some(ServerMessage::Lobbies {
                    lobbies: self.list_lobbies().await,
                }))
            }

            ClientMessage::UnwatchLobbies => {
                self.dispatcher.unwatch_directory(connection_id).await;
                Ok(None)
            }

            ClientMessage::Ping { timestamp } => Ok(Some(ServerMessage::pong(timestamp))),
        }
    }

    // =========================================================================
    // LOBBY MANAGEMENT
    // =========================================================================

    /// Create a lobby playing `game`, hosted by `host`.
    pub async fn create_lobby(
        &self,
        host: Identity,
        name: String,
        game: &str,
        capacity: usize,
        subscriber: Option<ConnectionId>,
    ) -> Result<SessionSnapshot, SessionError> {
        let name = name.trim().to_string();
        if name.is_empty() || name.chars().count() > MAX_LOBBY_NAME {
            return Err(SessionError::InvalidCommand(format!(
                "lobby name must be 1 to {} characters",
                MAX_LOBBY_NAME
            )));
        }
        let rules = self
            .catalog
            .get(game)
            .ok_or_else(|| SessionError::UnknownGame(game.to_string()))?;

        self.store
            .create_lobby(host, NewLobby { name, capacity, rules }, subscriber)
            .await
    }

    /// Open lobbies.
    pub async fn list_lobbies(&self) -> Vec<LobbySummary> {
        self.store.list_open_lobbies().await.collect().await
    }

    /// Join a lobby.
    pub async fn join_lobby(
        &self,
        lobby_id: LobbyId,
        identity: Identity,
        subscriber: Option<ConnectionId>,
    ) -> Result<SessionSnapshot, SessionError> {
        self.store.join(lobby_id, identity, subscriber).await
    }

    /// Leave a lobby. Idempotent.
    pub async fn leave_lobby(
        &self,
        lobby_id: LobbyId,
        identity_id: &IdentityId,
        subscriber: Option<ConnectionId>,
    ) -> Result<(), SessionError> {
        self.store
            .leave(lobby_id, identity_id, LeaveReason::Left, subscriber)
            .await
    }

    /// Apply a command on behalf of `issuer`, outside any connection.
    pub async fn submit(
        &self,
        lobby_id: LobbyId,
        issuer: &IdentityId,
        command: SessionCommand,
    ) -> Result<SessionEvent, SessionError> {
        validate_command(issuer, &command)?;
        self.store.apply_command(lobby_id, issuer, command, None).await
    }

    /// Snapshot of a lobby.
    pub async fn snapshot(&self, lobby_id: LobbyId) -> Result<SessionSnapshot, SessionError> {
        self.store.snapshot(lobby_id).await
    }

    /// Invariant check across all lobbies.
    pub async fn health(&self) -> HealthReport {
        self.store.health().await
    }
}

/// Shape checks that need no session state.
fn validate_command(issuer: &IdentityId, command: &SessionCommand) -> Result<(), SessionError> {
    match command {
        SessionCommand::Play { input } if !input.is_object() => Err(SessionError::InvalidCommand(
            "play input must be a JSON object".into(),
        )),
        SessionCommand::TransferHost { to } if to == issuer => Err(SessionError::InvalidCommand(
            "cannot transfer host to yourself".into(),
        )),
        _ => Ok(()),
    }
}
