//! Authentication error types and the error-code contract.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Error code for a request that needed a verified identity and had none.
pub const ERR_NOT_AUTHENTICATED: &str = "not_authenticated";

/// Error code for a credential that failed signature or shape checks.
pub const ERR_INVALID_TOKEN: &str = "invalid_token";

/// Error code for a structurally valid access token whose expiry has passed.
///
/// This exact string is the signal the client renewal link keys on to trigger
/// a renewal-and-replay; both sides reference this constant, and changing it
/// breaks the recovery path.
pub const ERR_ACCESS_TOKEN_EXPIRED: &str = "access_token_expired";

/// Error code for a session-store outage. Kept separate from the normal
/// "no renewal" outcome so operators can alert on infrastructure failures
/// without drowning in ordinary session expiry.
pub const ERR_STORE_UNAVAILABLE: &str = "session_store_unavailable";

/// Internal auth failure kind produced by the request gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// No credential on an operation that requires one
    NotAuthenticated,
    /// Credential present but bad signature or malformed
    InvalidToken,
    /// Credential present, well-signed, past its expiry
    AccessTokenExpired,
}

impl AuthErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            AuthErrorKind::NotAuthenticated => ERR_NOT_AUTHENTICATED,
            AuthErrorKind::InvalidToken => ERR_INVALID_TOKEN,
            AuthErrorKind::AccessTokenExpired => ERR_ACCESS_TOKEN_EXPIRED,
        }
    }
}

/// Rejection returned by the auth extractors.
///
/// Responds with the error code as JSON. Does NOT clear cookies: an expired
/// access token leaves the refresh cookie in place so the renewal call that
/// follows can still use it.
#[derive(Debug)]
pub struct ApiAuthError(pub AuthErrorKind);

impl IntoResponse for ApiAuthError {
    fn into_response(self) -> Response {
        use axum::Json;
        use serde::Serialize;

        #[derive(Serialize)]
        struct ErrorResponse {
            error: &'static str,
        }

        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: self.0.code(),
            }),
        )
            .into_response()
    }
}
