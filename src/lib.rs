pub mod api;
pub mod auth;
pub mod cli;
pub mod client;
pub mod db;
pub mod issuer;
pub mod jwt;
pub mod password;
pub mod rate_limit;

pub use api::{EventBus, UserEvent};

use api::create_api_router;
use axum::{Router, http::StatusCode, routing::get};
use db::Database;
use issuer::RotationMode;
use jwt::JwtConfig;
use rate_limit::RateLimitConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct ServerConfig {
    /// Database connection (cloneable, uses connection pool internally)
    pub db: Database,
    /// Secret for signing access tokens
    pub access_secret: Vec<u8>,
    /// Secret for signing refresh tokens. Must differ from the access secret
    pub refresh_secret: Vec<u8>,
    /// Access token lifetime in seconds
    pub access_ttl_secs: u64,
    /// Refresh token lifetime in seconds
    pub refresh_ttl_secs: u64,
    /// Whether to set the Secure flag on the refresh cookie (true in
    /// production behind HTTPS)
    pub secure_cookies: bool,
    /// How the stored refresh token is replaced on renewal
    pub rotation: RotationMode,
    /// Login attempts allowed per minute per client IP
    pub login_rate_per_minute: u32,
    /// Renewal attempts allowed per minute per client IP
    pub renew_rate_per_minute: u32,
    /// Bus the rest of the platform publishes user events on; authenticated
    /// subscription connections receive their share of it
    pub events: EventBus,
}

/// Create the application router with the given configuration.
pub fn create_app(config: &ServerConfig) -> Router {
    let jwt = Arc::new(JwtConfig::with_ttls(
        &config.access_secret,
        &config.refresh_secret,
        config.access_ttl_secs,
        config.refresh_ttl_secs,
    ));

    let rate_limits = RateLimitConfig::new(
        config.login_rate_per_minute,
        config.renew_rate_per_minute,
    );

    let api_router = create_api_router(
        config.db.clone(),
        jwt,
        config.secure_cookies,
        config.rotation,
        rate_limits,
        config.events.clone(),
    );

    Router::new()
        .route("/", get(health))
        .nest("/api", api_router)
}

/// Liveness probe.
async fn health() -> StatusCode {
    StatusCode::OK
}

/// Run the server on the given listener. This function blocks until the server exits.
pub async fn run_server(config: ServerConfig, listener: TcpListener) -> Result<(), std::io::Error> {
    let app = create_app(&config);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, make_service).await
}

/// Start the server on the given port in a background task. Use port 0 to let the OS choose a random port.
/// Returns the actual address the server is listening on.
/// Note: For production use, prefer `run_server` directly in main.
pub async fn start_server(
    config: ServerConfig,
    port: u16,
) -> (tokio::task::JoinHandle<()>, SocketAddr) {
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).await.expect("Failed to bind");
    let local_addr = listener.local_addr().expect("Failed to get local address");

    let handle = tokio::spawn(async move {
        run_server(config, listener).await.ok();
    });

    (handle, local_addr)
}
