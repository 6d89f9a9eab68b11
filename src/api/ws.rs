//! WebSocket subscription endpoint.
//!
//! A connection authenticates exactly once, with the first frame after the
//! upgrade: a typed `connection_init` handshake whose parameters must carry
//! `Authorization: Bearer <accessToken>`. No anonymous subscriptions; a
//! missing key or a token that fails the access codec closes the attempt.
//! There is no renewal path for a live connection - an expired token fails
//! the handshake and the client reconnects after renewing over HTTP. The
//! verified identity becomes the connection's context for its whole lifetime
//! and is what event delivery filters on.

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::jwt::{Identity, JwtConfig, TokenCodec, TokenError};

/// How long a fresh connection gets to present its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Keep-alive ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// State for the subscription endpoint.
#[derive(Clone)]
pub struct WsState {
    pub jwt: Arc<JwtConfig>,
    pub events: EventBus,
}

/// An event addressed to one user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEvent {
    pub recipient_user_id: i64,
    pub payload: serde_json::Value,
}

/// Broadcast bus the rest of the platform publishes user events on.
/// Each connection subscribes and forwards only what its identity may see.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UserEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Returns the number of connections it reached.
    pub fn publish(&self, event: UserEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Connection handshake parameters. Only `Authorization` is recognized;
/// it is required, and its absence fails the connection outright.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "Authorization")]
    pub authorization: Option<String>,
}

/// First frame a client must send after the upgrade.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    ConnectionInit { payload: Option<ConnectParams> },
}

/// Messages sent from server to client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    /// Handshake accepted; the connection now carries this identity
    ConnectionAck { user_id: i64 },
    /// Handshake refused; the connection is closing
    ConnectionError { message: String },
    /// An event addressed to this connection's identity
    Notification { event: UserEvent },
    /// Keep-alive
    Ping,
}

/// Identity context attached to an authenticated connection.
/// Established once at connect time, immutable for the connection lifetime.
#[derive(Debug, Clone, Copy)]
struct ConnectionContext {
    identity: Identity,
}

/// Why a connection attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    MissingAuthorization,
    Expired,
    Invalid,
}

impl ConnectError {
    pub fn message(self) -> &'static str {
        match self {
            ConnectError::MissingAuthorization => "Authorization parameter is missing",
            ConnectError::Expired => "Access token expired",
            ConnectError::Invalid => "Invalid access token",
        }
    }
}

/// Verify the handshake credential with the access codec.
pub fn authenticate_connection(
    params: &ConnectParams,
    codec: &TokenCodec,
) -> Result<Identity, ConnectError> {
    let Some(value) = params.authorization.as_deref() else {
        return Err(ConnectError::MissingAuthorization);
    };

    let token = value
        .strip_prefix("Bearer ")
        .ok_or(ConnectError::Invalid)?;

    match codec.verify(token) {
        Ok(identity) => Ok(identity),
        Err(TokenError::Expired) => Err(ConnectError::Expired),
        Err(_) => Err(ConnectError::Invalid),
    }
}

/// Should this event be delivered on a connection carrying this identity?
fn event_visible(event: &UserEvent, identity: &Identity) -> bool {
    event.recipient_user_id == identity.user_id
}

pub fn router(state: WsState) -> Router {
    Router::new().route("/", get(ws_handler)).with_state(state)
}

async fn ws_handler(
    State(state): State<WsState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, "Expected WebSocket upgrade").into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();

    // Handshake: the first frame decides whether this connection lives.
    let params = match tokio::time::timeout(HANDSHAKE_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::ConnectionInit { payload }) => payload.unwrap_or_default(),
            Err(_) => {
                reject(&mut sender, "Malformed handshake").await;
                return;
            }
        },
        _ => {
            reject(&mut sender, "Expected connection_init").await;
            return;
        }
    };

    let ctx = match authenticate_connection(&params, &state.jwt.access) {
        Ok(identity) => ConnectionContext { identity },
        Err(e) => {
            debug!("Refused subscription connection: {}", e.message());
            reject(&mut sender, e.message()).await;
            return;
        }
    };

    let ack = ServerMessage::ConnectionAck {
        user_id: ctx.identity.user_id,
    };
    if let Ok(json) = serde_json::to_string(&ack) {
        if sender.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    // Create channel for sending messages
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(32);

    // Forward outgoing messages to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Deliver events addressed to this connection's identity
    let mut events = state.events.subscribe();
    let tx_events = tx.clone();
    let identity = ctx.identity;
    let mut event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if !event_visible(&event, &identity) {
                        continue;
                    }
                    if tx_events
                        .send(ServerMessage::Notification { event })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Subscription fell behind, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Keep the connection alive
    let tx_ping = tx.clone();
    let mut ping_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        loop {
            interval.tick().await;
            if tx_ping.send(ServerMessage::Ping).await.is_err() {
                break;
            }
        }
    });

    // Drain incoming frames until the client goes away
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for any task to complete (connection closed)
    tokio::select! {
        _ = &mut send_task => {},
        _ = &mut recv_task => {},
        _ = &mut event_task => {},
        _ = &mut ping_task => {},
    }

    send_task.abort();
    recv_task.abort();
    event_task.abort();
    ping_task.abort();

    info!(user_id = ctx.identity.user_id, "Subscription connection closed");
}

async fn reject(sender: &mut SplitSink<WebSocket, Message>, message: &str) {
    let msg = ServerMessage::ConnectionError {
        message: message.to_string(),
    };
    if let Ok(json) = serde_json::to_string(&msg) {
        let _ = sender.send(Message::Text(json.into())).await;
    }
    let _ = sender.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt::{Claims, TokenKind};

    fn test_jwt() -> JwtConfig {
        JwtConfig::new(
            b"access-secret-for-testing-only!!",
            b"refresh-secret-for-testing-only!",
        )
    }

    fn params(authorization: Option<&str>) -> ConnectParams {
        ConnectParams {
            authorization: authorization.map(String::from),
        }
    }

    #[test]
    fn test_handshake_parses_connection_init() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"connection_init","payload":{"Authorization":"Bearer abc"}}"#,
        )
        .unwrap();

        let ClientMessage::ConnectionInit { payload } = msg;
        assert_eq!(payload.unwrap().authorization.as_deref(), Some("Bearer abc"));
    }

    #[test]
    fn test_handshake_without_payload_has_no_authorization() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"connection_init"}"#).unwrap();

        let ClientMessage::ConnectionInit { payload } = msg;
        assert!(payload.is_none());
    }

    #[test]
    fn test_handshake_rejects_unknown_type() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn test_connection_authenticates_with_access_token() {
        let jwt = test_jwt();
        let token = jwt.access.issue(42).unwrap();

        let identity =
            authenticate_connection(&params(Some(&format!("Bearer {}", token))), &jwt.access)
                .unwrap();
        assert_eq!(identity.user_id, 42);
    }

    #[test]
    fn test_connection_without_authorization_fails_closed() {
        let jwt = test_jwt();
        assert_eq!(
            authenticate_connection(&params(None), &jwt.access),
            Err(ConnectError::MissingAuthorization)
        );
    }

    #[test]
    fn test_connection_with_expired_token_is_refused() {
        use jsonwebtoken::{EncodingKey, Header};
        use std::time::{SystemTime, UNIX_EPOCH};

        let jwt = test_jwt();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let claims = Claims {
            sub: 42,
            kind: TokenKind::Access,
            iat: now - 100,
            exp: now - 50,
        };
        let token = jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"access-secret-for-testing-only!!"),
        )
        .unwrap();

        assert_eq!(
            authenticate_connection(&params(Some(&format!("Bearer {}", token))), &jwt.access),
            Err(ConnectError::Expired)
        );
    }

    #[test]
    fn test_connection_with_refresh_token_is_refused() {
        let jwt = test_jwt();
        let token = jwt.refresh.issue(42).unwrap();

        assert_eq!(
            authenticate_connection(&params(Some(&format!("Bearer {}", token))), &jwt.access),
            Err(ConnectError::Invalid)
        );
    }

    #[test]
    fn test_connection_with_malformed_scheme_is_refused() {
        let jwt = test_jwt();
        assert_eq!(
            authenticate_connection(&params(Some("token-without-scheme")), &jwt.access),
            Err(ConnectError::Invalid)
        );
    }

    #[test]
    fn test_events_filtered_by_connection_identity() {
        let identity = Identity {
            user_id: 42,
            issued_at: 0,
            expires_at: 0,
        };

        let mine = UserEvent {
            recipient_user_id: 42,
            payload: serde_json::json!({"kind": "review"}),
        };
        let theirs = UserEvent {
            recipient_user_id: 7,
            payload: serde_json::json!({"kind": "review"}),
        };

        assert!(event_visible(&mine, &identity));
        assert!(!event_visible(&theirs, &identity));
    }
}
