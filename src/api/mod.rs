mod error;
mod session;
mod users;
mod ws;

use axum::Router;
use std::sync::Arc;

use crate::db::Database;
use crate::issuer::RotationMode;
use crate::jwt::JwtConfig;
use crate::rate_limit::RateLimitConfig;

pub use ws::{EventBus, UserEvent};

/// Create the API router.
pub fn create_api_router(
    db: Database,
    jwt: Arc<JwtConfig>,
    secure_cookies: bool,
    rotation: RotationMode,
    rate_limits: RateLimitConfig,
    events: EventBus,
) -> Router {
    let session_state = session::SessionApiState {
        db: db.clone(),
        jwt: jwt.clone(),
        secure_cookies,
        rotation,
    };

    let users_state = users::UsersState {
        db,
        jwt: jwt.clone(),
    };

    let ws_state = ws::WsState { jwt, events };

    Router::new()
        .nest("/session", session::router(session_state, Arc::new(rate_limits)))
        .nest("/users", users::router(users_state))
        .nest("/subscriptions", ws::router(ws_state))
}
