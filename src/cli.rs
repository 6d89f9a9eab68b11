//! CLI argument parsing, validation, and startup helpers.

use crate::ServerConfig;
use crate::api::EventBus;
use crate::db::Database;
use crate::issuer::RotationMode;
use crate::jwt::{ACCESS_TOKEN_TTL_SECS, REFRESH_TOKEN_TTL_SECS};
use crate::rate_limit::{DEFAULT_LOGIN_PER_MINUTE, DEFAULT_RENEW_PER_MINUTE};
use clap::Parser;
use tracing::{error, info};
use url::Url;

const MIN_SECRET_LENGTH: usize = 32;

/// Environment variable holding the access-token signing secret.
pub const ACCESS_SECRET_ENV: &str = "ACCESS_TOKEN_SECRET";

/// Environment variable holding the refresh-token signing secret.
pub const REFRESH_SECRET_ENV: &str = "REFRESH_TOKEN_SECRET";

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "reelgate",
    about = "Authentication and session-renewal service for the film review platform"
)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "4000")]
    pub port: u16,

    /// Path to SQLite database file
    #[arg(short, long, default_value = "reelgate.db")]
    pub database: String,

    /// Public origin this service is reached at (e.g., "https://example.com").
    /// HTTPS origins get the Secure attribute on the refresh cookie
    #[arg(long, default_value = "http://localhost:4000")]
    pub public_origin: String,

    /// Path to file containing the access-token secret.
    /// Prefer using the ACCESS_TOKEN_SECRET env var instead
    #[arg(long)]
    pub access_secret_file: Option<String>,

    /// Path to file containing the refresh-token secret.
    /// Prefer using the REFRESH_TOKEN_SECRET env var instead
    #[arg(long)]
    pub refresh_secret_file: Option<String>,

    /// How the stored refresh token is replaced on renewal
    #[arg(long, value_enum, default_value = "overwrite")]
    pub rotation: RotationMode,

    /// Login attempts allowed per minute per client IP
    #[arg(long, default_value_t = DEFAULT_LOGIN_PER_MINUTE)]
    pub login_rate: u32,

    /// Renewal attempts allowed per minute per client IP
    #[arg(long, default_value_t = DEFAULT_RENEW_PER_MINUTE)]
    pub renew_rate: u32,

    /// Log output format
    #[arg(short, long, default_value = "pretty")]
    pub log_format: LogFormat,
}

/// Initialize logging based on the specified format.
pub fn init_logging(format: &LogFormat) {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::init(),
        LogFormat::Json => tracing_subscriber::fmt().json().init(),
        LogFormat::Compact => tracing_subscriber::fmt().compact().init(),
    }
}

/// Load a signing secret from the environment variable or a file.
/// Returns None and logs an error if the secret cannot be loaded.
pub fn load_secret(env_var: &str, secret_file: Option<&str>) -> Option<String> {
    let secret = if let Ok(secret) = std::env::var(env_var) {
        // Clear the environment variable to prevent leaking
        // SAFETY: We're single-threaded at this point during startup,
        // and no other code is reading this environment variable.
        unsafe { std::env::remove_var(env_var) };
        secret
    } else if let Some(path) = secret_file {
        match std::fs::read_to_string(path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                error!(path = %path, error = %e, "Failed to read secret file");
                return None;
            }
        }
    } else {
        error!(
            "Signing secret is required. Set the {} environment variable (recommended) or use the corresponding --*-secret-file flag",
            env_var
        );
        return None;
    };

    if secret.len() < MIN_SECRET_LENGTH {
        error!(
            "{} is shorter than {} characters. Use a longer secret",
            env_var, MIN_SECRET_LENGTH
        );
        return None;
    }

    Some(secret)
}

/// Parse and validate the public-origin URL.
/// Returns None and logs an error if validation fails.
pub fn validate_public_origin(public_origin: &str) -> Option<Url> {
    let url = match Url::parse(public_origin) {
        Ok(url) => url,
        Err(e) => {
            error!(origin = %public_origin, error = %e, "Invalid public-origin URL");
            return None;
        }
    };

    let is_https = url.scheme() == "https";
    let is_localhost = url.host_str() == Some("localhost");

    if !is_https && !is_localhost {
        error!("public-origin must use HTTPS for non-localhost deployments");
        return None;
    }

    Some(url)
}

/// Build ServerConfig from validated arguments.
pub fn build_config(
    db: Database,
    access_secret: String,
    refresh_secret: String,
    public_origin: &Url,
    rotation: RotationMode,
    login_rate: u32,
    renew_rate: u32,
) -> ServerConfig {
    let secure_cookies = public_origin.scheme() == "https";

    ServerConfig {
        db,
        access_secret: access_secret.into_bytes(),
        refresh_secret: refresh_secret.into_bytes(),
        access_ttl_secs: ACCESS_TOKEN_TTL_SECS,
        refresh_ttl_secs: REFRESH_TOKEN_TTL_SECS,
        secure_cookies,
        rotation,
        login_rate_per_minute: login_rate,
        renew_rate_per_minute: renew_rate,
        events: EventBus::default(),
    }
}

/// Open the database, logging errors if it fails.
pub async fn open_database(path: &str) -> Option<Database> {
    match Database::open(path).await {
        Ok(db) => {
            info!(path = %path, "Database opened");
            Some(db)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Failed to open database");
            None
        }
    }
}
