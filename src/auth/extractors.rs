//! Axum extractors gating protected operations.
//!
//! The gate reads the bearer credential from the Authorization header and
//! verifies it with the access codec. A missing header is an anonymous
//! context, not a failure; which operations tolerate anonymity is the
//! handler's call, made by choosing `Auth` or `MaybeAuth`. A credential that
//! is present but bad always fails the request, with expiry reported as its
//! own error code so the client can renew and replay.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};

use super::errors::{ApiAuthError, AuthErrorKind};
use super::state::HasAuthBackend;
use crate::jwt::{Identity, TokenError};

/// Core gate logic shared by the extractors.
///
/// Verification is signature-and-expiry only; no store round-trip happens on
/// the request path.
fn authenticate_request<S>(parts: &Parts, state: &S) -> Result<Option<Identity>, AuthErrorKind>
where
    S: HasAuthBackend,
{
    let Some(value) = parts.headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };

    let token = value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AuthErrorKind::InvalidToken)?;

    match state.jwt().access.verify(token) {
        Ok(identity) => Ok(Some(identity)),
        Err(TokenError::Expired) => Err(AuthErrorKind::AccessTokenExpired),
        Err(_) => Err(AuthErrorKind::InvalidToken),
    }
}

/// Extractor for operations that require a verified identity.
pub struct Auth(pub Identity);

impl<S> FromRequestParts<S> for Auth
where
    S: HasAuthBackend + Send + Sync,
{
    type Rejection = ApiAuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match authenticate_request(parts, state) {
            Ok(Some(identity)) => Ok(Auth(identity)),
            Ok(None) => Err(ApiAuthError(AuthErrorKind::NotAuthenticated)),
            Err(kind) => Err(ApiAuthError(kind)),
        }
    }
}

/// Extractor for operations that tolerate anonymity.
///
/// Yields `None` for a request with no Authorization header. A header that
/// is present but carries a bad or expired token still rejects the request;
/// anonymity is tolerated, bad credentials are not.
pub struct MaybeAuth(pub Option<Identity>);

impl<S> FromRequestParts<S> for MaybeAuth
where
    S: HasAuthBackend + Send + Sync,
{
    type Rejection = ApiAuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        authenticate_request(parts, state)
            .map(MaybeAuth)
            .map_err(ApiAuthError)
    }
}
