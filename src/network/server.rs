//! WebSocket Lobby Server
//!
//! Accepts WebSocket connections, authenticates them, and pumps JSON
//! messages between each socket and the command router. A background loop
//! sweeps expired grace periods, idle sockets and dead lobbies.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::game::GameCatalog;
use crate::lobby::session::SessionError;
use crate::lobby::store::LobbyConfig;
use crate::network::auth::{AuthConfig, IdentityVerifier, JwtVerifier};
use crate::network::protocol::{AuthRequest, AuthResult, ClientMessage, ErrorCode, ServerError, ServerMessage};
use crate::network::registry::DEFAULT_GRACE_PERIOD;
use crate::network::router::CommandRouter;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sockets.
    pub max_connections: usize,
    /// How long a dropped connection may be resumed.
    pub grace_period: Duration,
    /// How often the sweep loop runs.
    pub sweep_interval: Duration,
    /// Sockets silent for this long are closed.
    pub idle_timeout: Duration,
    /// Time allowed between handshake and `auth`.
    pub auth_timeout: Duration,
    /// Per-connection outbound queue length.
    pub outbox_capacity: usize,
    /// Largest accepted text frame.
    pub max_message_bytes: usize,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            grace_period: DEFAULT_GRACE_PERIOD,
            sweep_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            auth_timeout: Duration::from_secs(10),
            outbox_capacity: 256,
            max_message_bytes: 64 * 1024,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_connections: env_parse("MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            grace_period: env_secs("GRACE_PERIOD_SECS").unwrap_or(defaults.grace_period),
            sweep_interval: env_secs("SWEEP_INTERVAL_SECS").unwrap_or(defaults.sweep_interval),
            idle_timeout: env_secs("IDLE_TIMEOUT_SECS").unwrap_or(defaults.idle_timeout),
            auth_timeout: env_secs("AUTH_TIMEOUT_SECS").unwrap_or(defaults.auth_timeout),
            outbox_capacity: env_parse("OUTBOX_CAPACITY").unwrap_or(defaults.outbox_capacity),
            max_message_bytes: env_parse("MAX_MESSAGE_BYTES").unwrap_or(defaults.max_message_bytes),
            version: defaults.version,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum LobbyServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The lobby server.
pub struct LobbyServer {
    config: ServerConfig,
    router: Arc<CommandRouter>,
    verifier: Arc<dyn IdentityVerifier>,
    sockets: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl LobbyServer {
    /// Create a server.
    pub fn new(
        config: ServerConfig,
        lobby: LobbyConfig,
        verifier: Arc<dyn IdentityVerifier>,
        catalog: GameCatalog,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let router = Arc::new(CommandRouter::with_config(lobby, config.grace_period, catalog));

        Self {
            config,
            router,
            verifier,
            sockets: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Server configured entirely from the environment, with the bundled
    /// games and JWT authentication.
    pub fn from_env() -> Self {
        Self::new(
            ServerConfig::from_env(),
            LobbyConfig::from_env(),
            Arc::new(JwtVerifier::new(AuthConfig::from_env())),
            GameCatalog::with_builtin(),
        )
    }

    /// Configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Router, for embedding lobby management in another surface.
    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), LobbyServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), LobbyServerError> {
        info!("Lobby server listening on {}", listener.local_addr()?);

        let sweep_router = self.router.clone();
        let sweep_config = self.config.clone();
        let sweep_handle = tokio::spawn(async move {
            Self::run_sweep_loop(sweep_router, sweep_config).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.sockets.load(Ordering::Relaxed) >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        sweep_handle.abort();
        Ok(())
    }

    /// Spawn the task that owns one socket.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let router = self.router.clone();
        let verifier = self.verifier.clone();
        let config = self.config.clone();
        let sockets = self.sockets.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        sockets.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    sockets.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
            };
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();

            let Some(request) = await_auth(&mut ws_receiver, &mut ws_sender, config.auth_timeout).await else {
                debug!("Client {} never authenticated", addr);
                let _ = ws_sender.close().await;
                sockets.fetch_sub(1, Ordering::Relaxed);
                return;
            };

            let identity = match verifier.verify(&request.token) {
                Ok(identity) => identity,
                Err(e) => {
                    debug!("Auth failed for {}: {}", addr, e);
                    let _ = send_direct(&mut ws_sender, &auth_failure(&config, e.to_string())).await;
                    let _ = send_direct(
                        &mut ws_sender,
                        &ServerMessage::Error(ServerError {
                            code: ErrorCode::from(&e),
                            message: e.to_string(),
                            lobby_id: None,
                        }),
                    )
                    .await;
                    let _ = ws_sender.close().await;
                    sockets.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
            };

            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(config.outbox_capacity);
            let connected = match router
                .connect(identity.clone(), request.resume, msg_tx.clone(), Instant::now())
                .await
            {
                Ok(connected) => connected,
                Err(e) => {
                    let _ = send_direct(&mut ws_sender, &auth_failure(&config, e.to_string())).await;
                    let _ = ws_sender.close().await;
                    sockets.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
            };
            let attachment = connected.attachment;

            // Written before the sender task starts so it precedes any
            // snapshot already queued by a resume
            let accepted = ServerMessage::AuthResult(AuthResult {
                success: true,
                connection_id: Some(attachment.connection_id),
                identity: Some(identity.clone()),
                resumed: connected.resumed,
                error: None,
                server_version: config.version.clone(),
            });
            if send_direct(&mut ws_sender, &accepted).await.is_err() {
                router.disconnect(attachment, Instant::now()).await;
                sockets.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            info!(
                "Client {} authenticated as {} ({}, conn {})",
                addr,
                identity.display_name,
                identity.id.short(),
                attachment.connection_id.short()
            );

            let mut sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let closing = matches!(msg, ServerMessage::Shutdown { .. });
                    if send_direct(&mut ws_sender, &msg).await.is_err() {
                        break;
                    }
                    if closing {
                        let _ = ws_sender.close().await;
                        break;
                    }
                }
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                #[cfg(feature = "debug-tracing")]
                                debug!("<- {}: {}", addr, text);

                                let reply = if text.len() > config.max_message_bytes {
                                    Some(invalid_input("message too large"))
                                } else {
                                    match ClientMessage::from_json(&text) {
                                        Ok(client_msg) => {
                                            let lobby_id = client_msg.lobby_id();
                                            match router.handle(attachment, client_msg, Instant::now()).await {
                                                Ok(reply) => reply,
                                                Err(e) => {
                                                    debug!("Rejected request from {}: {}", addr, e);
                                                    Some(ServerMessage::error(&e, lobby_id))
                                                }
                                            }
                                        }
                                        Err(e) => {
                                            debug!("Invalid message from {}: {}", addr, e);
                                            Some(invalid_input("Invalid message format"))
                                        }
                                    }
                                };

                                if let Some(reply) = reply {
                                    if msg_tx.send(reply).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                let _ = msg_tx.send(invalid_input("binary frames are not supported")).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = &mut sender_task => {
                        debug!("Outbound side of {} closed", addr);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            sender_task.abort();
            router.disconnect(attachment, Instant::now()).await;
            sockets.fetch_sub(1, Ordering::Relaxed);
            debug!("Client {} detached", addr);
        });
    }

    /// Periodic housekeeping.
    async fn run_sweep_loop(router: Arc<CommandRouter>, config: ServerConfig) {
        let mut interval = interval(config.sweep_interval);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let evicted = router.sweep(now).await;
            if evicted > 0 {
                info!("Evicted {} connections after grace period", evicted);
            }

            for connection_id in router.registry().idle(now, config.idle_timeout).await {
                if let Some(outbox) = router.registry().outbox(connection_id).await {
                    let _ = outbox.try_send(ServerMessage::Shutdown {
                        reason: "idle timeout".to_string(),
                    });
                    info!("Closing idle connection {}", connection_id.short());
                }
            }

            router.store().cleanup().await;

            let report = router.health().await;
            for violation in &report.violations {
                error!("Invariant violation: {}", violation);
            }
            debug!(
                "Sweep: {} lobbies, {} members, {} connections",
                report.lobbies,
                report.members,
                router.registry().count().await
            );
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Open sockets.
    pub fn socket_count(&self) -> usize {
        self.sockets.load(Ordering::Relaxed)
    }

    /// Live lobbies.
    pub async fn lobby_count(&self) -> usize {
        self.router.store().lobby_count().await
    }
}

/// Wait for the `auth` message. Anything else is answered with
/// `not_authenticated`.
async fn await_auth(receiver: &mut WsSource, sender: &mut WsSink, timeout: Duration) -> Option<AuthRequest> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return None,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                    Ok(ClientMessage::Auth(request)) => return Some(request),
                    _ => {
                        let reply = ServerMessage::error(&SessionError::NotAuthenticated, None);
                        if send_direct(sender, &reply).await.is_err() {
                            return None;
                        }
                    }
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                _ => {}
            }
        }
    }
}

async fn send_direct(sender: &mut WsSink, msg: &ServerMessage) -> Result<(), LobbyServerError> {
    let text = match msg.to_json() {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text)).await?;
    Ok(())
}

fn auth_failure(config: &ServerConfig, error: String) -> ServerMessage {
    ServerMessage::AuthResult(AuthResult {
        success: false,
        connection_id: None,
        identity: None,
        resumed: false,
        error: Some(error),
        server_version: config.version.clone(),
    })
}

fn invalid_input(message: &str) -> ServerMessage {
    ServerMessage::Error(ServerError {
        code: ErrorCode::InvalidInput,
        message: message.to_string(),
        lobby_id: None,
    })
}
