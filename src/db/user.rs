use sqlx::sqlite::SqlitePool;

/// Store for the users a session can be issued for.
///
/// This is the find-by-identity collaborator of the authentication flow; the
/// rest of the platform's user handling lives elsewhere.
#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub created_at: String,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    email: String,
    username: String,
    password_hash: String,
    created_at: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            username: row.username,
            password_hash: row.password_hash,
            created_at: row.created_at,
        }
    }
}

const SELECT_USER: &str = "SELECT id, email, username, password_hash, created_at FROM users";

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new user. Returns the user id.
    pub async fn create(
        &self,
        email: &str,
        username: &str,
        password_hash: &str,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query("INSERT INTO users (email, username, password_hash) VALUES (?, ?, ?)")
            .bind(email)
            .bind(username)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Get a user by id.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        let row: Option<UserRow> = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_USER))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(User::from))
    }

    /// Get a user by email or username, whichever matches.
    pub async fn get_by_email_or_username(
        &self,
        email_or_username: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("{} WHERE email = ? OR username = ?", SELECT_USER))
                .bind(email_or_username)
                .bind(email_or_username)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(User::from))
    }

    /// Delete a user.
    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
