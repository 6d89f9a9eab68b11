//! Request-side authentication.
//!
//! Dual-token system: short-lived access tokens arrive as
//! `Authorization: Bearer` headers and are verified statelessly per request;
//! long-lived refresh tokens live in an HTTP-only cookie and are only read
//! by the renewal endpoint.

mod cookie;
mod errors;
mod extractors;
mod state;

pub use cookie::{REFRESH_COOKIE_NAME, clear_refresh_cookie, get_cookie, refresh_cookie};
pub use errors::{
    ApiAuthError, AuthErrorKind, ERR_ACCESS_TOKEN_EXPIRED, ERR_INVALID_TOKEN,
    ERR_NOT_AUTHENTICATED, ERR_STORE_UNAVAILABLE,
};
pub use extractors::{Auth, MaybeAuth};
pub use state::HasAuthBackend;
