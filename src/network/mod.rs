//! Network Layer
//!
//! WebSocket transport, connection tracking and fan-out. Everything that
//! decides lobby state lives in `lobby/`; this layer routes requests to it
//! and delivers what it emits.

pub mod auth;
pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;

pub use auth::{validate_token, AuthConfig, AuthError, IdentityVerifier, JwtVerifier, TokenClaims};
pub use dispatcher::{BroadcastDispatcher, Delivery, DispatchError};
pub use protocol::{AuthRequest, AuthResult, ClientMessage, ErrorCode, Outbox, ServerError, ServerMessage};
pub use registry::{Attachment, ConnectionRegistry, Liveness, DEFAULT_GRACE_PERIOD};
pub use router::{CommandRouter, Connected};
pub use server::{LobbyServer, LobbyServerError, ServerConfig};
