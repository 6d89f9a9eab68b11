#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use reelgate::{
    EventBus, ServerConfig, create_app,
    db::Database,
    issuer::RotationMode,
    jwt::{JwtConfig, REFRESH_TOKEN_TTL_SECS},
};
use tower::ServiceExt;

pub const TEST_IP: &str = "127.0.0.1";

pub const ACCESS_SECRET: &[u8] = b"access-secret-for-testing-only!!";
pub const REFRESH_SECRET: &[u8] = b"refresh-secret-for-testing-only!";

pub struct TestApp {
    pub app: Router,
    pub db: Database,
    pub jwt: JwtConfig,
}

pub async fn setup() -> TestApp {
    TestAppBuilder::new().build().await
}

/// Builder for test setup with various options.
pub struct TestAppBuilder {
    access_ttl_secs: u64,
    rotation: RotationMode,
    login_rate: u32,
    renew_rate: u32,
}

impl TestAppBuilder {
    pub fn new() -> Self {
        Self {
            access_ttl_secs: 300,
            rotation: RotationMode::Overwrite,
            // Generous defaults so ordinary tests never trip the limiter
            login_rate: 10_000,
            renew_rate: 10_000,
        }
    }

    pub fn with_access_ttl(mut self, secs: u64) -> Self {
        self.access_ttl_secs = secs;
        self
    }

    pub fn with_rotation(mut self, rotation: RotationMode) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_login_rate(mut self, per_minute: u32) -> Self {
        self.login_rate = per_minute;
        self
    }

    pub async fn build(self) -> TestApp {
        let db = Database::open(":memory:")
            .await
            .expect("Failed to open test database");

        let jwt = JwtConfig::with_ttls(
            ACCESS_SECRET,
            REFRESH_SECRET,
            self.access_ttl_secs,
            REFRESH_TOKEN_TTL_SECS,
        );

        let config = ServerConfig {
            db: db.clone(),
            access_secret: ACCESS_SECRET.to_vec(),
            refresh_secret: REFRESH_SECRET.to_vec(),
            access_ttl_secs: self.access_ttl_secs,
            refresh_ttl_secs: REFRESH_TOKEN_TTL_SECS,
            secure_cookies: false,
            rotation: self.rotation,
            login_rate_per_minute: self.login_rate,
            renew_rate_per_minute: self.renew_rate,
            events: EventBus::default(),
        };

        TestApp {
            app: create_app(&config),
            db,
            jwt,
        }
    }
}

/// One request through the router; returns status, Set-Cookie values, and
/// the parsed JSON body.
pub async fn send_json(
    app: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<serde_json::Value>,
) -> (StatusCode, Vec<String>, serde_json::Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", TEST_IP);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let cookies = response
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(String::from)
        .collect();

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };

    (status, cookies, json)
}

/// Extract the refresh token value from a list of Set-Cookie headers.
pub fn refresh_token_from_cookies(cookies: &[String]) -> Option<String> {
    cookies
        .iter()
        .find_map(|c| c.strip_prefix("refreshtoken="))
        .map(|rest| rest.split(';').next().unwrap_or("").to_string())
        .filter(|v| !v.is_empty())
}

/// Check if cookies contain the refresh token being cleared (Max-Age=0).
pub fn has_cleared_refresh_cookie(cookies: &[String]) -> bool {
    cookies
        .iter()
        .any(|c| c.starts_with("refreshtoken=") && c.contains("Max-Age=0"))
}

/// Mint an already-expired token of the given kind, signed with the matching
/// test secret.
pub fn expired_token(user_id: i64, kind: reelgate::jwt::TokenKind) -> String {
    use jsonwebtoken::{EncodingKey, Header};
    use reelgate::jwt::{Claims, TokenKind};
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let claims = Claims {
        sub: user_id,
        kind,
        iat: now - 100,
        exp: now - 50,
    };
    let secret = match kind {
        TokenKind::Access => ACCESS_SECRET,
        TokenKind::Refresh => REFRESH_SECRET,
    };

    jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

pub fn refresh_cookie_header(token: &str) -> String {
    format!("refreshtoken={}", token)
}

pub struct LoginResult {
    pub user_id: i64,
    pub access_token: String,
    pub refresh_token: String,
}

/// Create an account through the API. Returns the user id.
pub async fn sign_up(app: &Router, email: &str, username: &str, password: &str) -> i64 {
    let (status, _, body) = send_json(
        app,
        "POST",
        "/api/users",
        &[],
        Some(serde_json::json!({
            "email": email,
            "username": username,
            "password": password,
        })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED, "sign-up failed: {}", body);
    body["id"].as_i64().expect("sign-up response carries an id")
}

/// Log in through the API and pull the issued credentials apart.
pub async fn login(app: &Router, email_or_username: &str, password: &str) -> LoginResult {
    let (status, cookies, body) = send_json(
        app,
        "POST",
        "/api/session",
        &[],
        Some(serde_json::json!({
            "emailOrUsername": email_or_username,
            "password": password,
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "login failed: {}", body);

    LoginResult {
        user_id: body["user"]["id"].as_i64().expect("login response carries the user"),
        access_token: body["accessToken"]
            .as_str()
            .expect("login response carries an access token")
            .to_string(),
        refresh_token: refresh_token_from_cookies(&cookies)
            .expect("login sets the refresh cookie"),
    }
}
