//! Signed, time-limited token generation and verification.
//!
//! Dual-token system: short-lived access tokens (stateless, verified by
//! signature and expiry only) and long-lived refresh tokens (additionally
//! confirmed against the session store). Each kind is signed with its own
//! secret, so an access token can never be presented as a refresh token.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Token kind discriminator, embedded in the claims as `typ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Short-lived access token (5 minutes) - stateless
    Access,
    /// Long-lived refresh token (2 weeks) - tracked in the session store
    Refresh,
}

/// Claims carried by both token kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: i64,
    /// Token kind
    #[serde(rename = "typ")]
    pub kind: TokenKind,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// Verified identity extracted from a token. Immutable once issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            issued_at: claims.iat,
            expires_at: claims.exp,
        }
    }
}

/// Access token duration: 5 minutes
pub const ACCESS_TOKEN_TTL_SECS: u64 = 5 * 60;

/// Refresh token duration: 2 weeks
pub const REFRESH_TOKEN_TTL_SECS: u64 = 14 * 24 * 60 * 60;

/// Codec for one token kind: one signing secret, one time-to-live.
#[derive(Clone)]
pub struct TokenCodec {
    kind: TokenKind,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_secs: u64,
}

impl TokenCodec {
    pub fn new(secret: &[u8], kind: TokenKind, ttl_secs: u64) -> Self {
        Self {
            kind,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl_secs,
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Issue a token for a user, expiring `ttl_secs` from now.
    pub fn issue(&self, user_id: i64) -> Result<String, TokenError> {
        let now = unix_now()?;

        let claims = Claims {
            sub: user_id,
            kind: self.kind,
            iat: now,
            exp: now + self.ttl_secs,
        };

        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(TokenError::Encoding)
    }

    /// Verify a token and extract the identity it carries.
    ///
    /// `Expired` means the signature checked out but the embedded expiry has
    /// passed; callers may recover by renewing. Any other failure (bad
    /// signature, malformed structure, wrong token kind) is `Invalid` and is
    /// never recoverable.
    pub fn verify(&self, token: &str) -> Result<Identity, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let token_data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            })?;

        if token_data.claims.kind != self.kind {
            return Err(TokenError::Invalid);
        }

        Ok(token_data.claims.into())
    }
}

/// Codec pair for the two token kinds, each with a distinct secret.
#[derive(Clone)]
pub struct JwtConfig {
    pub access: TokenCodec,
    pub refresh: TokenCodec,
}

impl JwtConfig {
    pub fn new(access_secret: &[u8], refresh_secret: &[u8]) -> Self {
        Self::with_ttls(
            access_secret,
            refresh_secret,
            ACCESS_TOKEN_TTL_SECS,
            REFRESH_TOKEN_TTL_SECS,
        )
    }

    pub fn with_ttls(
        access_secret: &[u8],
        refresh_secret: &[u8],
        access_ttl_secs: u64,
        refresh_ttl_secs: u64,
    ) -> Self {
        Self {
            access: TokenCodec::new(access_secret, TokenKind::Access, access_ttl_secs),
            refresh: TokenCodec::new(refresh_secret, TokenKind::Refresh, refresh_ttl_secs),
        }
    }
}

fn unix_now() -> Result<u64, TokenError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| TokenError::Time)
}

/// Errors from token operations.
#[derive(Debug)]
pub enum TokenError {
    /// Error encoding the token
    Encoding(jsonwebtoken::errors::Error),
    /// Signature valid but the embedded expiry has passed
    Expired,
    /// Bad signature, malformed structure, or wrong token kind
    Invalid,
    /// System time error
    Time,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Encoding(e) => write!(f, "Failed to encode token: {}", e),
            TokenError::Expired => write!(f, "Token expired"),
            TokenError::Invalid => write!(f, "Invalid token"),
            TokenError::Time => write!(f, "System time error"),
        }
    }
}

impl std::error::Error for TokenError {}
