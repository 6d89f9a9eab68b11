//! Token-pair issuance and refresh-token rotation.

use std::sync::Arc;

use crate::db::{SessionStore, SessionStoreError};
use crate::jwt::{JwtConfig, TokenError};

/// How the stored refresh token is replaced on renewal.
///
/// `Overwrite` reproduces the source design: renewal validates the presented
/// token against the stored value, then writes the replacement
/// unconditionally. Two concurrent renewals from the same stale token can
/// both pass validation and both write, with the second write winning - a
/// known double-rotation race. `CompareAndSwap` closes it by making the
/// validate-and-replace a single conditional store update; the loser of the
/// race gets no renewal.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RotationMode {
    #[default]
    Overwrite,
    CompareAndSwap,
}

/// A freshly issued access/refresh token pair.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// Mints token pairs and keeps the session store's current refresh token in
/// step with what was handed out.
#[derive(Clone)]
pub struct TokenIssuer {
    jwt: Arc<JwtConfig>,
    sessions: SessionStore,
}

impl TokenIssuer {
    pub fn new(jwt: Arc<JwtConfig>, sessions: SessionStore) -> Self {
        Self { jwt, sessions }
    }

    /// Issue a token pair for a user and record the refresh token as the
    /// user's current one, replacing any prior value.
    ///
    /// The store write must complete before the pair is returned: handing out
    /// credentials whose refresh token was never recorded would leave the
    /// client unable to ever renew them.
    pub async fn issue_pair(&self, user_id: i64) -> Result<TokenPair, IssueError> {
        let pair = self.mint(user_id)?;

        self.sessions
            .put(user_id, &pair.refresh)
            .await
            .map_err(IssueError::Store)?;

        Ok(pair)
    }

    /// Rotate the user's refresh token as part of a renewal.
    ///
    /// The caller has already checked that `presented` equals the stored
    /// value. In `Overwrite` mode the new pair is written unconditionally;
    /// in `CompareAndSwap` mode the write only lands if the stored value is
    /// still `presented`, and `None` is returned when it is not.
    pub async fn rotate_pair(
        &self,
        user_id: i64,
        presented: &str,
        mode: RotationMode,
    ) -> Result<Option<TokenPair>, IssueError> {
        match mode {
            RotationMode::Overwrite => self.issue_pair(user_id).await.map(Some),
            RotationMode::CompareAndSwap => {
                let pair = self.mint(user_id)?;

                let swapped = self
                    .sessions
                    .swap_if_current(user_id, presented, &pair.refresh)
                    .await
                    .map_err(IssueError::Store)?;

                Ok(swapped.then_some(pair))
            }
        }
    }

    fn mint(&self, user_id: i64) -> Result<TokenPair, IssueError> {
        let access = self.jwt.access.issue(user_id).map_err(IssueError::Token)?;
        let refresh = self.jwt.refresh.issue(user_id).map_err(IssueError::Token)?;
        Ok(TokenPair { access, refresh })
    }
}

/// Errors from issuing a token pair.
#[derive(Debug)]
pub enum IssueError {
    /// Minting a token failed
    Token(TokenError),
    /// Recording the refresh token failed; no pair was handed out
    Store(SessionStoreError),
}

impl std::fmt::Display for IssueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueError::Token(e) => write!(f, "Failed to mint token: {}", e),
            IssueError::Store(e) => write!(f, "Failed to record refresh token: {}", e),
        }
    }
}

impl std::error::Error for IssueError {}
