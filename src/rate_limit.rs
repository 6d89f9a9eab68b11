//! Rate limiting for credential endpoints.
//!
//! Token bucket with per-IP tracking on login and renewal, the two endpoints
//! worth brute-forcing.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{Quota, RateLimiter, clock::DefaultClock, state::keyed::DefaultKeyedStateStore};
use std::{num::NonZeroU32, sync::Arc};

/// Per-IP keyed rate limiter.
pub type IpLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Requests per minute allowed on the login endpoint, per IP.
pub const DEFAULT_LOGIN_PER_MINUTE: u32 = 10;

/// Requests per minute allowed on the renewal endpoint, per IP.
/// Renewal fires at most once per access-token lifetime per well-behaved
/// client, so this stays low without hurting legitimate traffic.
pub const DEFAULT_RENEW_PER_MINUTE: u32 = 30;

/// Rate limiting configuration for the credential endpoints.
#[derive(Clone)]
pub struct RateLimitConfig {
    pub login: Arc<IpLimiter>,
    pub renew: Arc<IpLimiter>,
}

impl RateLimitConfig {
    pub fn new(login_per_minute: u32, renew_per_minute: u32) -> Self {
        Self {
            login: Arc::new(RateLimiter::keyed(per_minute(login_per_minute))),
            renew: Arc::new(RateLimiter::keyed(per_minute(renew_per_minute))),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(DEFAULT_LOGIN_PER_MINUTE, DEFAULT_RENEW_PER_MINUTE)
    }
}

fn per_minute(n: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(n.max(1)).expect("clamped to at least 1"))
}

/// Middleware for rate limiting the login endpoint.
pub async fn rate_limit_login(
    State(config): State<Arc<RateLimitConfig>>,
    request: Request,
    next: Next,
) -> Response {
    check(&config.login, request, next).await
}

/// Middleware for rate limiting the renewal endpoint.
pub async fn rate_limit_renew(
    State(config): State<Arc<RateLimitConfig>>,
    request: Request,
    next: Next,
) -> Response {
    check(&config.renew, request, next).await
}

async fn check(limiter: &IpLimiter, request: Request, next: Next) -> Response {
    let Some(ip) = client_ip(&request) else {
        return (StatusCode::FORBIDDEN, "Unable to determine client IP.").into_response();
    };

    match limiter.check_key(&ip) {
        Ok(_) => next.run(request).await,
        Err(_) => (
            StatusCode::TOO_MANY_REQUESTS,
            "Too many attempts. Please wait before trying again.",
        )
            .into_response(),
    }
}

/// Extract the client IP from X-Forwarded-For (reverse proxy) or the
/// connection info.
fn client_ip(request: &Request) -> Option<String> {
    use axum::extract::ConnectInfo;
    use std::net::SocketAddr;

    if let Some(forwarded_for) = request.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded_for.to_str() {
            if let Some(first_ip) = value.split(',').next() {
                let ip = first_ip.trim();
                if !ip.is_empty() {
                    return Some(ip.to_string());
                }
            }
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
}
