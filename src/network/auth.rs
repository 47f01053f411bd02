//! Authentication
//!
//! Turns a bearer token into a verified [`Identity`]. Tokens are JWTs
//! issued by an external provider; this server only validates them. For
//! local development an anonymous mode accepts any non-empty token as a
//! display name.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::core::ids::{Identity, IdentityId};
use crate::network::protocol::ErrorCode;

/// Longest display name kept from a token.
pub const MAX_DISPLAY_NAME: usize = 32;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format.
    pub public_key_pem: Option<String>,
    /// HS256 secret.
    pub secret: Option<String>,
    /// Skip expiry validation (tests only).
    pub skip_expiry: bool,
    /// Accept unsigned tokens as display names when no key is configured.
    pub allow_anonymous: bool,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: env_flag("AUTH_SKIP_EXPIRY"),
            allow_anonymous: env_flag("AUTH_ALLOW_ANONYMOUS"),
        }
    }

    /// Check if a signing key is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Claims we read from provider tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the provider's user id.
    pub sub: String,
    /// Display name, if the provider includes one.
    #[serde(default)]
    pub name: Option<String>,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

impl TokenClaims {
    /// Stable identity id: the first 16 bytes of SHA-256 over the subject.
    pub fn identity_id(&self) -> IdentityId {
        derive_identity_id(b"lobby-sync-identity:", &self.sub)
    }

    /// Verified identity for these claims.
    pub fn identity(&self) -> Identity {
        let name = self.name.as_deref().unwrap_or(&self.sub);
        Identity::new(self.identity_id(), truncate_name(name))
    }
}

fn derive_identity_id(domain: &[u8], subject: &str) -> IdentityId {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(subject.as_bytes());
    let hash = hasher.finalize();

    let mut id = [0u8; 16];
    id.copy_from_slice(&hash[..16]);
    IdentityId::from_bytes(id)
}

fn truncate_name(name: &str) -> String {
    name.chars().take(MAX_DISPLAY_NAME).collect()
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No authentication configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

impl From<&AuthError> for ErrorCode {
    fn from(err: &AuthError) -> Self {
        match err {
            AuthError::Expired => ErrorCode::TokenExpired,
            AuthError::InvalidFormat | AuthError::InvalidSignature | AuthError::DecodeError(_) => {
                ErrorCode::InvalidToken
            }
            _ => ErrorCode::AuthFailed,
        }
    }
}

/// Turns a bearer token into an identity.
pub trait IdentityVerifier: Send + Sync {
    /// Verify `token`.
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Verifier backed by [`AuthConfig`].
#[derive(Debug, Clone)]
pub struct JwtVerifier {
    config: AuthConfig,
}

impl JwtVerifier {
    /// Create a verifier.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if !self.config.is_configured() && self.config.allow_anonymous {
            let name = token.trim();
            if name.is_empty() {
                return Err(AuthError::MissingClaim("name".into()));
            }
            return Ok(Identity::new(
                derive_identity_id(b"lobby-sync-anonymous:", name),
                truncate_name(name),
            ));
        }
        validate_token(token, &self.config).map(|claims| claims.identity())
    }
}

/// Validate a JWT token and extract claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let (key, algorithm) = decoding_key(config)?;
    let claims = decode::<TokenClaims>(token, &key, &validation_for(config, algorithm))
        .map_err(map_jwt_error)?
        .claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }
    // exp == 0 means the provider did not set one
    if !config.skip_expiry && claims.exp > 0 && unix_now() > claims.exp {
        return Err(AuthError::Expired);
    }
    Ok(claims)
}

/// RS256 when a public key is configured, HS256 otherwise.
fn decoding_key(config: &AuthConfig) -> Result<(DecodingKey, Algorithm), AuthError> {
    match (&config.public_key_pem, &config.secret) {
        (Some(pem), _) => DecodingKey::from_rsa_pem(pem.as_bytes())
            .map(|key| (key, Algorithm::RS256))
            .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e))),
        (None, Some(secret)) => Ok((DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)),
        (None, None) => Err(AuthError::NotConfigured),
    }
}

fn validation_for(config: &AuthConfig, algorithm: Algorithm) -> Validation {
    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims.clear();
    validation.validate_exp = !config.skip_expiry;

    if let Some(issuer) = &config.issuer {
        validation.set_issuer(&[issuer]);
    }
    match &config.audience {
        Some(audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }
    validation
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    fn sign(claims: &TokenClaims, secret: &str) -> String {
        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&Header::new(Algorithm::HS256), claims, &key).unwrap()
    }

    fn claims(sub: &str) -> TokenClaims {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        TokenClaims {
            sub: sub.into(),
            name: Some("Ana".into()),
            exp: now + 3600,
            iat: now,
            iss: Some("test-issuer".into()),
            aud: None,
        }
    }

    fn hs256() -> AuthConfig {
        AuthConfig {
            secret: Some(SECRET.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_verifier_yields_identity() {
        let verifier = JwtVerifier::new(hs256());
        let identity = verifier.verify(&sign(&claims("user123"), SECRET)).unwrap();

        assert_eq!(identity.display_name, "Ana");
        assert_eq!(identity.id, claims("user123").identity_id());
    }

    #[test]
    fn test_identity_is_stable_per_subject() {
        assert_eq!(claims("user123").identity_id(), claims("user123").identity_id());
        assert_ne!(claims("user123").identity_id(), claims("user456").identity_id());
    }

    #[test]
    fn test_name_falls_back_to_subject() {
        let mut c = claims("user123");
        c.name = None;
        assert_eq!(c.identity().display_name, "user123");
    }

    #[test]
    fn test_expired_token_rejected() {
        let mut c = claims("user123");
        c.exp = 1;
        let err = validate_token(&sign(&c, SECRET), &hs256()).unwrap_err();
        assert!(matches!(err, AuthError::Expired));
        assert_eq!(ErrorCode::from(&err), ErrorCode::TokenExpired);
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let token = sign(&claims("user123"), "correct-secret-key-here!!!!!");
        let err = validate_token(&token, &hs256()).unwrap_err();
        assert!(matches!(err, AuthError::InvalidSignature));
        assert_eq!(ErrorCode::from(&err), ErrorCode::InvalidToken);
    }

    #[test]
    fn test_missing_sub_rejected() {
        let token = sign(&claims(""), SECRET);
        assert!(matches!(validate_token(&token, &hs256()), Err(AuthError::MissingClaim(_))));
    }

    #[test]
    fn test_issuer_validation() {
        let config = AuthConfig {
            issuer: Some("wrong-issuer".into()),
            ..hs256()
        };
        let token = sign(&claims("user123"), SECRET);
        assert!(matches!(validate_token(&token, &config), Err(AuthError::InvalidIssuer)));
    }

    #[test]
    fn test_not_configured_error() {
        let verifier = JwtVerifier::new(AuthConfig::default());
        assert!(matches!(verifier.verify("some.jwt.token"), Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_anonymous_mode() {
        let verifier = JwtVerifier::new(AuthConfig {
            allow_anonymous: true,
            ..Default::default()
        });

        let a = verifier.verify("  ana ").unwrap();
        assert_eq!(a.display_name, "ana");
        assert_eq!(verifier.verify("ana").unwrap().id, a.id);
        assert!(verifier.verify("   ").is_err());

        let long = "x".repeat(100);
        assert_eq!(verifier.verify(&long).unwrap().display_name.len(), MAX_DISPLAY_NAME);
    }

    #[test]
    fn test_anonymous_ignored_when_key_configured() {
        let verifier = JwtVerifier::new(AuthConfig {
            allow_anonymous: true,
            ..hs256()
        });
        assert!(verifier.verify("ana").is_err());
    }
}
