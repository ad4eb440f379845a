//! # relay-auth
//!
//! Verification of client bearer tokens: HS256 JWTs signed with a shared
//! symmetric secret. Verification is a pure function of the token string,
//! the secret, and the clock — no I/O.
//!
//! Tokens signed with any other algorithm are rejected outright; accepting
//! the header's algorithm claim would let a caller downgrade the check.

#![deny(unsafe_code)]

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity claims extracted from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub user_id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    /// Expiry as a unix timestamp.
    pub expires_at: i64,
}

/// Why a token failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Not a structurally valid JWT.
    #[error("malformed token")]
    InvalidFormat,
    /// Signature mismatch, or an algorithm other than HS256.
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    /// Structurally valid and signed, but missing required claims.
    #[error("invalid token claims")]
    InvalidClaims,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawClaims {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    exp: i64,
}

/// Verifies bearer tokens against the shared secret.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        // Validation::new pins the accepted algorithm set to exactly HS256.
        let validation = Validation::new(Algorithm::HS256);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify a token and extract its identity claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data =
            decode::<RawClaims>(token, &self.key, &self.validation).map_err(map_jwt_error)?;

        let user_id = match data.claims.user_id {
            Some(uid) if !uid.is_empty() => uid,
            _ => return Err(AuthError::InvalidClaims),
        };

        Ok(Claims {
            user_id,
            username: data.claims.username,
            email: data.claims.email,
            expires_at: data.claims.exp,
        })
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::InvalidAlgorithmName
        | ErrorKind::ImmatureSignature => AuthError::InvalidSignature,
        ErrorKind::MissingRequiredClaim(_) => AuthError::InvalidClaims,
        _ => AuthError::InvalidFormat,
    }
}

/// Sign a token for the given identity, expiring `ttl_secs` from `now`.
///
/// The hub only verifies; this exists for tests and operator tooling that
/// need a token against a known secret.
pub fn mint(
    secret: &str,
    user_id: &str,
    username: Option<&str>,
    email: Option<&str>,
    now: i64,
    ttl_secs: i64,
) -> Result<String, AuthError> {
    let claims = RawClaims {
        user_id: Some(user_id.to_string()),
        username: username.map(str::to_string),
        email: email.map(str::to_string),
        exp: now + ttl_secs,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AuthError::InvalidFormat)
}
