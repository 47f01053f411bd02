//! Lobby Sync Server
//!
//! Binds the WebSocket server and runs until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lobby_sync::{
    game::GameCatalog,
    lobby::LobbyConfig,
    network::{AuthConfig, JwtVerifier, LobbyServer, ServerConfig},
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();
    let lobby = LobbyConfig::from_env();
    let auth = AuthConfig::from_env();
    let catalog = GameCatalog::with_builtin();

    info!("Lobby Sync Server v{}", VERSION);
    info!("Games: {}", catalog.names().collect::<Vec<_>>().join(", "));
    info!(
        "Grace period: {}s, max lobby capacity: {}, anonymous auth: {}",
        config.grace_period.as_secs(),
        lobby.max_capacity,
        auth.allow_anonymous
    );

    let server = Arc::new(LobbyServer::new(
        config,
        lobby,
        Arc::new(JwtVerifier::new(auth)),
        catalog,
    ));

    let runner = server.clone();
    let mut handle = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("Interrupted, shutting down");
            server.shutdown();
            handle.await.context("server task panicked")??;
        }
        result = &mut handle => {
            result.context("server task panicked")??;
        }
    }

    Ok(())
}
