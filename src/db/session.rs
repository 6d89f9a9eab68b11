//! Current-refresh-token storage, keyed by user id.
//!
//! Exactly one refresh token is current per user at any time. A presented
//! refresh token is honored for renewal only if it equals the stored value,
//! which makes tokens single-use-until-rotated and makes revocation a row
//! delete. Rows carry no TTL of their own: the token's signed expiry bounds
//! its useful life.

use sqlx::sqlite::SqlitePool;
use std::future::Future;
use std::time::Duration;

/// Upper bound on any single store round-trip.
const STORE_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Store mapping `user_id` to the current refresh token.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Set the current refresh token for a user, overwriting any prior value.
    pub async fn put(&self, user_id: i64, refresh_token: &str) -> Result<(), SessionStoreError> {
        bounded(
            sqlx::query(
                "INSERT INTO sessions (user_id, refresh_token, updated_at)
                 VALUES (?, ?, datetime('now'))
                 ON CONFLICT(user_id) DO UPDATE SET
                     refresh_token = excluded.refresh_token,
                     updated_at = excluded.updated_at",
            )
            .bind(user_id)
            .bind(refresh_token)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    /// Get the current refresh token for a user, if any.
    pub async fn get(&self, user_id: i64) -> Result<Option<String>, SessionStoreError> {
        let row: Option<(String,)> = bounded(
            sqlx::query_as("SELECT refresh_token FROM sessions WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool),
        )
        .await?;
        Ok(row.map(|r| r.0))
    }

    /// Delete the entry for a user (revoke the session).
    pub async fn delete(&self, user_id: i64) -> Result<bool, SessionStoreError> {
        let result = bounded(
            sqlx::query("DELETE FROM sessions WHERE user_id = ?")
                .bind(user_id)
                .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace the stored value only if it still equals `expected`.
    ///
    /// Returns false when the stored value has moved on (or the row is gone),
    /// in which case nothing is written. Single-statement, so the comparison
    /// and the write cannot interleave with another rotation.
    pub async fn swap_if_current(
        &self,
        user_id: i64,
        expected: &str,
        replacement: &str,
    ) -> Result<bool, SessionStoreError> {
        let result = bounded(
            sqlx::query(
                "UPDATE sessions SET refresh_token = ?, updated_at = datetime('now')
                 WHERE user_id = ? AND refresh_token = ?",
            )
            .bind(replacement)
            .bind(user_id)
            .bind(expected)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Run a store call under the bounded timeout.
async fn bounded<T>(
    fut: impl Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, SessionStoreError> {
    match tokio::time::timeout(STORE_CALL_TIMEOUT, fut).await {
        Ok(result) => result.map_err(SessionStoreError::Unavailable),
        Err(_) => Err(SessionStoreError::Timeout),
    }
}

/// Store failures. Transient unavailability is surfaced to the caller and
/// must never be conflated with "no session".
#[derive(Debug)]
pub enum SessionStoreError {
    /// The underlying store rejected or failed the call
    Unavailable(sqlx::Error),
    /// The call did not complete within the bounded timeout
    Timeout,
}

impl std::fmt::Display for SessionStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStoreError::Unavailable(e) => write!(f, "Session store unavailable: {}", e),
            SessionStoreError::Timeout => write!(f, "Session store call timed out"),
        }
    }
}

impl std::error::Error for SessionStoreError {}

#[cfg(test)]
mod tests {
    use crate::db::Database;

    #[tokio::test]
    async fn test_put_then_get() {
        let db = Database::open(":memory:").await.unwrap();
        let sessions = db.sessions();

        sessions.put(42, "token-1").await.unwrap();
        assert_eq!(sessions.get(42).await.unwrap(), Some("token-1".into()));
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let db = Database::open(":memory:").await.unwrap();
        let sessions = db.sessions();

        sessions.put(42, "token-1").await.unwrap();
        sessions.put(42, "token-2").await.unwrap();

        assert_eq!(sessions.get(42).await.unwrap(), Some("token-2".into()));
    }

    #[tokio::test]
    async fn test_get_absent() {
        let db = Database::open(":memory:").await.unwrap();
        assert_eq!(db.sessions().get(42).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete() {
        let db = Database::open(":memory:").await.unwrap();
        let sessions = db.sessions();

        sessions.put(42, "token-1").await.unwrap();
        assert!(sessions.delete(42).await.unwrap());
        assert_eq!(sessions.get(42).await.unwrap(), None);

        // Second delete finds nothing
        assert!(!sessions.delete(42).await.unwrap());
    }

    #[tokio::test]
    async fn test_swap_if_current_matches() {
        let db = Database::open(":memory:").await.unwrap();
        let sessions = db.sessions();

        sessions.put(42, "token-1").await.unwrap();
        assert!(sessions.swap_if_current(42, "token-1", "token-2").await.unwrap());
        assert_eq!(sessions.get(42).await.unwrap(), Some("token-2".into()));
    }

    #[tokio::test]
    async fn test_swap_if_current_stale_value_refused() {
        let db = Database::open(":memory:").await.unwrap();
        let sessions = db.sessions();

        sessions.put(42, "token-2").await.unwrap();

        // token-1 was rotated away; swapping from it must not succeed
        assert!(!sessions.swap_if_current(42, "token-1", "token-3").await.unwrap());
        assert_eq!(sessions.get(42).await.unwrap(), Some("token-2".into()));
    }

    #[tokio::test]
    async fn test_swap_if_current_missing_row_refused() {
        let db = Database::open(":memory:").await.unwrap();
        assert!(
            !db.sessions()
                .swap_if_current(42, "token-1", "token-2")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_sessions_are_per_user() {
        let db = Database::open(":memory:").await.unwrap();
        let sessions = db.sessions();

        sessions.put(1, "token-a").await.unwrap();
        sessions.put(2, "token-b").await.unwrap();

        assert_eq!(sessions.get(1).await.unwrap(), Some("token-a".into()));
        assert_eq!(sessions.get(2).await.unwrap(), Some("token-b".into()));
    }
}
