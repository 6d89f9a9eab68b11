//! Refresh-token cookie handling.
//!
//! The refresh token travels only inside an HTTP-only cookie; client code
//! never sees it. Login and every successful renewal set it, logout clears
//! it.

use axum::http::header;

/// Cookie name for the refresh token (long-lived, 2 weeks).
pub const REFRESH_COOKIE_NAME: &str = "refreshtoken";

/// Extract a cookie value from the Cookie header.
pub fn get_cookie<'a>(headers: &'a axum::http::HeaderMap, name: &str) -> Option<&'a str> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in cookie_header.split(';') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            if key.trim() == name {
                return Some(value.trim());
            }
        }
    }
    None
}

/// Build the Set-Cookie value carrying a refresh token.
///
/// SameSite=None so the cookie rides on cross-origin renewal calls from the
/// web client; browsers then require Secure, which is enabled whenever the
/// deployment origin is HTTPS.
pub fn refresh_cookie(token: &str, max_age_secs: u64, secure: bool) -> String {
    let secure = if secure { "; Secure" } else { "" };
    format!(
        "{}={}; HttpOnly; SameSite=None; Path=/; Max-Age={}{}",
        REFRESH_COOKIE_NAME, token, max_age_secs, secure
    )
}

/// Build the Set-Cookie value that clears the refresh token.
pub fn clear_refresh_cookie(secure: bool) -> String {
    let secure = if secure { "; Secure" } else { "" };
    format!(
        "{}=; HttpOnly; SameSite=None; Path=/; Max-Age=0{}",
        REFRESH_COOKIE_NAME, secure
    )
}
