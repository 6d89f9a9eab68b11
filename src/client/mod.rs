//! Client-side request link with transparent session renewal.
//!
//! Wraps every outgoing operation: the access token is read from an owned,
//! thread-safe cell and attached as a bearer credential; when the server
//! answers with the exact access-token-expired signal, the link renews the
//! session once and replays the operation once. Concurrent operations that
//! hit expiry together share a single in-flight renewal instead of each
//! issuing their own. A renewal that comes back empty means the session is
//! over: local credentials are cleared and the original failure is returned
//! to the caller unmodified.

mod http;

pub use http::HttpTransport;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use crate::auth::ERR_ACCESS_TOKEN_EXPIRED;

/// Path of the login operation.
pub const LOGIN_PATH: &str = "/api/session";

/// Path of the logout operation.
pub const LOGOUT_PATH: &str = "/api/session/logout";

/// Path of the renewal operation.
pub const RENEW_PATH: &str = "/api/session/refresh";

/// The one client-held credential: a single mutable access-token value.
///
/// Owned and injected rather than global; every reader takes a snapshot, so
/// an operation uses one consistent token even while a renewal is storing a
/// new one.
#[derive(Clone, Default)]
pub struct AccessTokenCell {
    inner: Arc<RwLock<Option<String>>>,
}

impl AccessTokenCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current token, if any.
    pub fn snapshot(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Overwrite the token (login, successful renewal).
    pub fn store(&self, token: String) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(token);
    }

    /// Drop the token (logout, session ended).
    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// One outgoing operation.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: axum::http::Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: axum::http::Method::GET,
            path: path.into(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: axum::http::Method::POST,
            path: path.into(),
            body: Some(body),
        }
    }
}

/// One operation's outcome as seen by the link: status plus parsed body.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The server's error code, when the body carries one.
    pub fn error_code(&self) -> Option<&str> {
        self.body.get("error")?.as_str()
    }

    /// Does this response carry the exact expired-access signal?
    /// Matching anything looser would retry failures that renewal cannot fix.
    pub fn is_access_token_expired(&self) -> bool {
        self.error_code() == Some(ERR_ACCESS_TOKEN_EXPIRED)
    }
}

/// How the link reaches the server. Seam for tests; `HttpTransport` is the
/// real one.
pub trait Transport: Send + Sync + 'static {
    /// Send one operation, attaching the given bearer credential.
    fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> impl Future<Output = Result<ApiResponse, TransportError>> + Send;

    /// Call the renewal operation. `Ok(None)` is the server's "no renewal".
    fn renew(&self) -> impl Future<Output = Result<Option<String>, TransportError>> + Send;
}

/// Transport-level failure. Carries a message only, so one in-flight renewal
/// can hand the same failure to every waiter.
#[derive(Debug, Clone)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// Errors surfaced to callers of the link.
#[derive(Debug, Clone)]
pub enum ClientError {
    /// The operation itself could not be sent
    Transport(TransportError),
    /// The renewal attempt failed (network error, server error)
    Renewal(TransportError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Transport(e) => write!(f, "Request failed: {}", e),
            ClientError::Renewal(e) => write!(f, "Session renewal failed: {}", e),
        }
    }
}

impl std::error::Error for ClientError {}

/// Where an operation is in its recovery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationState {
    /// First attempt, no recovery spent yet
    Idle,
    /// Suspended on the shared renewal attempt
    RenewalInFlight,
    /// Renewed; the single replay is in flight
    Replaying,
}

type SharedRenewal = Shared<BoxFuture<'static, Result<Option<String>, TransportError>>>;

/// The renewal link.
pub struct RenewalLink<T> {
    transport: Arc<T>,
    token: AccessTokenCell,
    inflight: Mutex<Option<SharedRenewal>>,
}

impl<T: Transport> RenewalLink<T> {
    pub fn new(transport: T) -> Self {
        Self::with_token_cell(transport, AccessTokenCell::new())
    }

    /// Build the link around an existing token cell, e.g. one shared with
    /// other request-building code.
    pub fn with_token_cell(transport: T, token: AccessTokenCell) -> Self {
        Self {
            transport: Arc::new(transport),
            token,
            inflight: Mutex::new(None),
        }
    }

    pub fn token_cell(&self) -> &AccessTokenCell {
        &self.token
    }

    /// Run one operation through the link.
    ///
    /// Exactly one renewal and one replay per operation; every response that
    /// does not carry the expired-access signal passes through untouched.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ClientError> {
        let mut state = OperationState::Idle;

        loop {
            let bearer = self.token.snapshot();
            let response = self
                .transport
                .send(request, bearer.as_deref())
                .await
                .map_err(ClientError::Transport)?;

            if !response.is_access_token_expired() {
                return Ok(response);
            }

            match state {
                OperationState::Idle => {
                    state = OperationState::RenewalInFlight;
                    match self.renew_coalesced().await {
                        Ok(Some(token)) => {
                            self.token.store(token);
                            state = OperationState::Replaying;
                        }
                        Ok(None) => {
                            // Session ended. Clear local credentials and hand
                            // the caller the original failure unmodified.
                            self.token.clear();
                            return Ok(response);
                        }
                        Err(e) => return Err(ClientError::Renewal(e)),
                    }
                }
                // The one renewal for this operation is spent
                OperationState::RenewalInFlight | OperationState::Replaying => {
                    return Ok(response);
                }
            }
        }
    }

    /// Log in and keep the returned access token. The refresh token never
    /// surfaces here; the transport's cookie jar carries it.
    pub async fn login(
        &self,
        email_or_username: &str,
        password: &str,
    ) -> Result<ApiResponse, ClientError> {
        let request = ApiRequest::post(
            LOGIN_PATH,
            serde_json::json!({
                "emailOrUsername": email_or_username,
                "password": password,
            }),
        );

        let response = self
            .transport
            .send(&request, None)
            .await
            .map_err(ClientError::Transport)?;

        if let Some(token) = response.body.get("accessToken").and_then(|v| v.as_str()) {
            self.token.store(token.to_string());
        }

        Ok(response)
    }

    /// Log out and drop the stored access token.
    pub async fn logout(&self) -> Result<ApiResponse, ClientError> {
        let request = ApiRequest::post(LOGOUT_PATH, serde_json::json!({}));
        let response = self
            .transport
            .send(&request, self.token.snapshot().as_deref())
            .await
            .map_err(ClientError::Transport)?;

        self.token.clear();
        Ok(response)
    }

    /// Await the in-flight renewal, starting one only if none is running.
    ///
    /// All concurrent callers share one attempt and one result - success or
    /// failure alike releases every waiter identically.
    async fn renew_coalesced(&self) -> Result<Option<String>, TransportError> {
        let shared = {
            let mut slot = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(shared) => shared.clone(),
                None => {
                    let transport = self.transport.clone();
                    let shared = async move { transport.renew().await }.boxed().shared();
                    *slot = Some(shared.clone());
                    shared
                }
            }
        };

        let result = shared.clone().await;

        // Retire the attempt so a later expiry starts a fresh one. Any waiter
        // may get here first; only the attempt it awaited is removed.
        {
            let mut slot = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&shared)) {
                *slot = None;
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// What the mock's renewal endpoint does.
    #[derive(Debug, Clone)]
    enum RenewBehavior {
        /// Grant this token and start accepting it
        Grant(String),
        /// Grant this token but keep rejecting it (stale grant)
        GrantStale(String),
        /// "No renewal"
        Deny,
        /// Network-level failure
        Fail,
    }

    #[derive(Clone)]
    struct MockTransport {
        inner: Arc<MockInner>,
    }

    struct MockInner {
        valid: Mutex<Option<String>>,
        renew: RenewBehavior,
        renew_delay: Duration,
        send_calls: AtomicUsize,
        renew_calls: AtomicUsize,
    }

    impl MockTransport {
        fn new(valid: Option<&str>, renew: RenewBehavior) -> Self {
            Self::with_delay(valid, renew, Duration::ZERO)
        }

        fn with_delay(valid: Option<&str>, renew: RenewBehavior, renew_delay: Duration) -> Self {
            Self {
                inner: Arc::new(MockInner {
                    valid: Mutex::new(valid.map(String::from)),
                    renew,
                    renew_delay,
                    send_calls: AtomicUsize::new(0),
                    renew_calls: AtomicUsize::new(0),
                }),
            }
        }

        fn send_calls(&self) -> usize {
            self.inner.send_calls.load(Ordering::SeqCst)
        }

        fn renew_calls(&self) -> usize {
            self.inner.renew_calls.load(Ordering::SeqCst)
        }
    }

    fn expired_response() -> ApiResponse {
        ApiResponse {
            status: 401,
            body: serde_json::json!({ "error": ERR_ACCESS_TOKEN_EXPIRED }),
        }
    }

    impl Transport for MockTransport {
        async fn send(
            &self,
            _request: &ApiRequest,
            bearer: Option<&str>,
        ) -> Result<ApiResponse, TransportError> {
            self.inner.send_calls.fetch_add(1, Ordering::SeqCst);

            let valid = self.inner.valid.lock().unwrap().clone();
            if bearer.is_some() && bearer.map(String::from) == valid {
                Ok(ApiResponse {
                    status: 200,
                    body: serde_json::json!({ "data": "ok" }),
                })
            } else {
                Ok(expired_response())
            }
        }

        async fn renew(&self) -> Result<Option<String>, TransportError> {
            self.inner.renew_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.inner.renew_delay).await;

            match &self.inner.renew {
                RenewBehavior::Grant(token) => {
                    *self.inner.valid.lock().unwrap() = Some(token.clone());
                    Ok(Some(token.clone()))
                }
                RenewBehavior::GrantStale(token) => Ok(Some(token.clone())),
                RenewBehavior::Deny => Ok(None),
                RenewBehavior::Fail => Err(TransportError("connection reset".into())),
            }
        }
    }

    #[tokio::test]
    async fn test_expired_token_renews_and_replays_once() {
        let mock = MockTransport::new(Some("fresh"), RenewBehavior::Grant("fresh".into()));
        let link = RenewalLink::new(mock.clone());
        link.token_cell().store("stale".into());

        let response = link.execute(&ApiRequest::get("/api/users/me")).await.unwrap();

        assert!(response.is_success());
        assert_eq!(mock.send_calls(), 2, "original attempt plus one replay");
        assert_eq!(mock.renew_calls(), 1);
        assert_eq!(link.token_cell().snapshot().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_no_renewal_surfaces_original_failure_and_clears_token() {
        let mock = MockTransport::new(None, RenewBehavior::Deny);
        let link = RenewalLink::new(mock.clone());
        link.token_cell().store("stale".into());

        let response = link.execute(&ApiRequest::get("/api/users/me")).await.unwrap();

        // The original expired failure comes back unmodified
        assert!(response.is_access_token_expired());
        assert_eq!(mock.send_calls(), 1, "no replay without a renewal");
        assert_eq!(link.token_cell().snapshot(), None, "logged-out state");
    }

    #[tokio::test]
    async fn test_renewal_failure_propagates() {
        let mock = MockTransport::new(None, RenewBehavior::Fail);
        let link = RenewalLink::new(mock.clone());
        link.token_cell().store("stale".into());

        let result = link.execute(&ApiRequest::get("/api/users/me")).await;

        assert!(matches!(result, Err(ClientError::Renewal(_))));
        // The failed attempt was retired; the next operation may renew again
        assert!(
            link.inflight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_replay_happens_exactly_once() {
        // The grant is stale: the replayed request expires again. The link
        // must hand that failure back rather than renew a second time.
        let mock = MockTransport::new(None, RenewBehavior::GrantStale("never-valid".into()));
        let link = RenewalLink::new(mock.clone());
        link.token_cell().store("stale".into());

        let response = link.execute(&ApiRequest::get("/api/users/me")).await.unwrap();

        assert!(response.is_access_token_expired());
        assert_eq!(mock.send_calls(), 2);
        assert_eq!(mock.renew_calls(), 1);
    }

    #[tokio::test]
    async fn test_other_errors_pass_through_without_renewal() {
        struct FailingTransport;

        impl Transport for FailingTransport {
            async fn send(
                &self,
                _request: &ApiRequest,
                _bearer: Option<&str>,
            ) -> Result<ApiResponse, TransportError> {
                Ok(ApiResponse {
                    status: 500,
                    body: serde_json::json!({ "error": "Database error" }),
                })
            }

            async fn renew(&self) -> Result<Option<String>, TransportError> {
                panic!("renewal must not run for non-expiry errors");
            }
        }

        let link = RenewalLink::new(FailingTransport);
        link.token_cell().store("anything".into());

        let response = link.execute(&ApiRequest::get("/api/users/me")).await.unwrap();
        assert_eq!(response.status, 500);
    }

    #[tokio::test]
    async fn test_concurrent_expiries_share_one_renewal() {
        let mock = MockTransport::with_delay(
            None,
            RenewBehavior::Grant("fresh".into()),
            Duration::from_millis(50),
        );
        let link = Arc::new(RenewalLink::new(mock.clone()));
        link.token_cell().store("stale".into());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let link = link.clone();
            handles.push(tokio::spawn(async move {
                link.execute(&ApiRequest::get("/api/users/me")).await
            }));
        }

        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert!(response.is_success());
        }

        assert_eq!(mock.renew_calls(), 1, "renewal attempts must coalesce");
    }

    #[tokio::test]
    async fn test_concurrent_waiters_all_get_the_same_failure() {
        let mock = MockTransport::with_delay(
            None,
            RenewBehavior::Fail,
            Duration::from_millis(50),
        );
        let link = Arc::new(RenewalLink::new(mock.clone()));
        link.token_cell().store("stale".into());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let link = link.clone();
            handles.push(tokio::spawn(async move {
                link.execute(&ApiRequest::get("/api/users/me")).await
            }));
        }

        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(ClientError::Renewal(_))
            ));
        }

        assert_eq!(mock.renew_calls(), 1);
    }

    #[tokio::test]
    async fn test_login_stores_access_token() {
        struct LoginTransport;

        impl Transport for LoginTransport {
            async fn send(
                &self,
                request: &ApiRequest,
                _bearer: Option<&str>,
            ) -> Result<ApiResponse, TransportError> {
                assert_eq!(request.path, LOGIN_PATH);
                Ok(ApiResponse {
                    status: 200,
                    body: serde_json::json!({
                        "user": { "id": 42, "email": "a@example.com", "username": "alice" },
                        "accessToken": "issued-at-login",
                    }),
                })
            }

            async fn renew(&self) -> Result<Option<String>, TransportError> {
                Ok(None)
            }
        }

        let link = RenewalLink::new(LoginTransport);
        link.login("alice", "password123").await.unwrap();

        assert_eq!(
            link.token_cell().snapshot().as_deref(),
            Some("issued-at-login")
        );
    }
}
