//! Session API endpoints.
//!
//! - POST `/` - Log in: verify credentials, issue a token pair
//! - GET `/` - Describe the current request identity (anonymous tolerated)
//! - POST `/refresh` - Exchange the refresh-token cookie for a new pair
//! - POST `/logout` - Drop the server-side session and clear the cookie

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::{ApiError, ResultExt};
use super::users::UserInfo;
use crate::auth::{
    MaybeAuth, REFRESH_COOKIE_NAME, clear_refresh_cookie, get_cookie, refresh_cookie,
};
use crate::db::Database;
use crate::impl_has_auth_backend;
use crate::issuer::{IssueError, RotationMode, TokenIssuer, TokenPair};
use crate::jwt::{Identity, JwtConfig};
use crate::password::verify_password;
use crate::rate_limit::{RateLimitConfig, rate_limit_login, rate_limit_renew};

#[derive(Clone)]
pub struct SessionApiState {
    pub db: Database,
    pub jwt: Arc<JwtConfig>,
    pub secure_cookies: bool,
    pub rotation: RotationMode,
}

impl_has_auth_backend!(SessionApiState);

impl SessionApiState {
    fn issuer(&self) -> TokenIssuer {
        TokenIssuer::new(self.jwt.clone(), self.db.sessions())
    }

    fn set_refresh_cookie(&self, pair: &TokenPair) -> (axum::http::HeaderName, String) {
        (
            SET_COOKIE,
            refresh_cookie(&pair.refresh, self.jwt.refresh.ttl_secs(), self.secure_cookies),
        )
    }
}

pub fn router(state: SessionApiState, rate: Arc<RateLimitConfig>) -> Router {
    let login_route = Router::new()
        .route("/", post(login))
        .route_layer(middleware::from_fn_with_state(rate.clone(), rate_limit_login));

    let renew_route = Router::new()
        .route("/refresh", post(refresh))
        .route_layer(middleware::from_fn_with_state(rate, rate_limit_renew));

    Router::new()
        .route("/", get(session_probe))
        .route("/logout", post(logout))
        .merge(login_route)
        .merge(renew_route)
        .with_state(state)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    email_or_username: String,
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    user: UserInfo,
    access_token: String,
}

/// Verify credentials and hand out a token pair. The refresh token is
/// recorded as the user's current session before anything is returned, then
/// travels back only inside the HTTP-only cookie; the access token goes in
/// the body for the client to hold.
async fn login(
    State(state): State<SessionApiState>,
    Json(req): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let user = state
        .db
        .users()
        .get_by_email_or_username(&req.email_or_username)
        .await
        .db_err("Failed to look up user")?
        .ok_or_else(|| ApiError::unauthorized("Unknown user or wrong password"))?;

    if !verify_password(&req.password, &user.password_hash) {
        return Err(ApiError::unauthorized("Unknown user or wrong password"));
    }

    let pair = state.issuer().issue_pair(user.id).await.map_err(|e| match e {
        IssueError::Store(e) => ApiError::store_error("Failed to record session", e),
        e => {
            tracing::error!("Failed to issue token pair: {}", e);
            ApiError::internal("Failed to issue tokens")
        }
    })?;

    let cookie = state.set_refresh_cookie(&pair);
    Ok((
        StatusCode::OK,
        [cookie],
        Json(LoginResponse {
            user: user.into(),
            access_token: pair.access,
        }),
    )
        .into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentitySnapshot {
    user_id: i64,
    issued_at: u64,
    expires_at: u64,
}

impl From<Identity> for IdentitySnapshot {
    fn from(identity: Identity) -> Self {
        Self {
            user_id: identity.user_id,
            issued_at: identity.issued_at,
            expires_at: identity.expires_at,
        }
    }
}

#[derive(Serialize)]
struct SessionProbeResponse {
    identity: Option<IdentitySnapshot>,
}

/// Report the identity this request carries, or null when anonymous.
/// Anonymity is fine here; a bad credential still fails in the extractor.
async fn session_probe(MaybeAuth(identity): MaybeAuth) -> Json<SessionProbeResponse> {
    Json(SessionProbeResponse {
        identity: identity.map(IdentitySnapshot::from),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenewedAccess {
    access_token: String,
}

/// Exchange a valid refresh-token cookie for a new token pair.
///
/// Every validation failure - no cookie, unverifiable token, no stored
/// session, stored value not matching the presented one, rotation lost to a
/// concurrent renewal - is the same normal outcome: a `null` body and no new
/// credentials. The client treats that as "session ended". Only a session
/// store outage is an actual error response.
async fn refresh(
    State(state): State<SessionApiState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let Some(presented) = get_cookie(&headers, REFRESH_COOKIE_NAME) else {
        return Ok(no_renewal());
    };

    let Ok(identity) = state.jwt.refresh.verify(presented) else {
        return Ok(no_renewal());
    };

    let stored = state
        .db
        .sessions()
        .get(identity.user_id)
        .await
        .store_err("Failed to read session")?;

    let Some(stored) = stored else {
        return Ok(no_renewal());
    };

    // The stored value is the only honored refresh token for this user; a
    // mismatch means the presented one was already rotated away (or forged).
    if stored != presented {
        debug!(user_id = identity.user_id, "Presented refresh token is not current");
        return Ok(no_renewal());
    }

    // The user must still exist before new credentials are minted for them.
    let user_exists = state
        .db
        .users()
        .get_by_id(identity.user_id)
        .await
        .db_err("Failed to load user")?
        .is_some();
    if !user_exists {
        return Ok(no_renewal());
    }

    let rotated = state
        .issuer()
        .rotate_pair(identity.user_id, presented, state.rotation)
        .await
        .map_err(|e| match e {
            IssueError::Store(e) => ApiError::store_error("Failed to rotate session", e),
            e => {
                tracing::error!("Failed to issue token pair: {}", e);
                ApiError::internal("Failed to issue tokens")
            }
        })?;

    let Some(pair) = rotated else {
        return Ok(no_renewal());
    };

    let cookie = state.set_refresh_cookie(&pair);
    Ok((
        StatusCode::OK,
        [cookie],
        Json(Some(RenewedAccess {
            access_token: pair.access,
        })),
    )
        .into_response())
}

fn no_renewal() -> Response {
    (StatusCode::OK, Json(None::<RenewedAccess>)).into_response()
}

/// Drop the server-side session (revocation-by-delete) and clear the cookie.
/// Best effort: the cookie is cleared even when there is nothing to revoke.
async fn logout(State(state): State<SessionApiState>, headers: HeaderMap) -> Response {
    if let Some(token) = get_cookie(&headers, REFRESH_COOKIE_NAME) {
        if let Ok(identity) = state.jwt.refresh.verify(token) {
            if let Err(e) = state.db.sessions().delete(identity.user_id).await {
                warn!(user_id = identity.user_id, "Failed to revoke session: {}", e);
            }
        }
    }

    (
        StatusCode::OK,
        [(SET_COOKIE, clear_refresh_cookie(state.secure_cookies))],
        Json(serde_json::json!({ "success": true })),
    )
        .into_response()
}
