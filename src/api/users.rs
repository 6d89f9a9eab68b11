//! User account API endpoints.
//!
//! - POST `/` - Create a new account
//! - GET `/me` - Current user for the verified identity

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::{ApiError, ResultExt};
use crate::auth::Auth;
use crate::db::{Database, User};
use crate::impl_has_auth_backend;
use crate::jwt::JwtConfig;
use crate::password::hash_password;

#[derive(Clone)]
pub struct UsersState {
    pub db: Database,
    pub jwt: Arc<JwtConfig>,
}

impl_has_auth_backend!(UsersState);

pub fn router(state: UsersState) -> Router {
    Router::new()
        .route("/", post(sign_up))
        .route("/me", get(me))
        .with_state(state)
}

/// Public view of a user. Never carries the password hash.
#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub id: i64,
    pub email: String,
    pub username: String,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            username: user.username,
        }
    }
}

#[derive(Deserialize)]
struct SignUpRequest {
    email: String,
    username: String,
    password: String,
}

const MIN_PASSWORD_LENGTH: usize = 8;

async fn sign_up(
    State(state): State<UsersState>,
    Json(req): Json<SignUpRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !req.email.contains('@') {
        return Err(ApiError::bad_request("Invalid email address"));
    }
    if req.username.trim().is_empty() {
        return Err(ApiError::bad_request("Username cannot be empty"));
    }
    if req.password.len() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::bad_request("Password is too short"));
    }

    let password_hash = hash_password(&req.password)
        .map_err(|e| ApiError::internal(format!("Failed to hash password: {}", e)))?;

    let id = match state
        .db
        .users()
        .create(&req.email, &req.username, &password_hash)
        .await
    {
        Ok(id) => id,
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            return Err(ApiError::conflict("Email or username already taken"));
        }
        Err(e) => return Err(ApiError::db_error("Failed to create user", e)),
    };

    let user = state
        .db
        .users()
        .get_by_id(id)
        .await
        .db_err("Failed to load created user")?
        .ok_or_else(|| ApiError::internal("Created user not found"))?;

    Ok((StatusCode::CREATED, Json(UserInfo::from(user))))
}

/// Current user for the verified identity. Requires authentication.
async fn me(
    State(state): State<UsersState>,
    Auth(identity): Auth,
) -> Result<Json<UserInfo>, ApiError> {
    let user = state
        .db
        .users()
        .get_by_id(identity.user_id)
        .await
        .db_err("Failed to load user")?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    Ok(Json(user.into()))
}
