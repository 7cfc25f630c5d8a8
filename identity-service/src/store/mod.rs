//! Persistence boundary for identities and their credentials.

mod memory;
mod postgres;

pub use memory::MemoryIdentityStore;
pub use postgres::PostgresIdentityStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::authz::Filter;
use crate::models::{ApiKey, Identity, NewRefreshToken, RefreshToken};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identity store unavailable: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("identity store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unique constraint violated: {0}")]
    Conflict(String),

    #[error("invalid stored row: {0}")]
    InvalidRow(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db) = err.as_database_error() {
            if db.is_unique_violation() {
                return StoreError::Conflict(db.message().to_string());
            }
        }
        StoreError::Transient(anyhow::Error::new(err))
    }
}

/// Bound a store call by `limit`. Dropping the returned future drops the
/// inner call with it.
pub async fn with_deadline<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn health_check(&self) -> Result<(), StoreError>;

    // Identities

    async fn find_identity_by_id(&self, id: Uuid) -> Result<Option<Identity>, StoreError>;

    async fn find_identity_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Identity>, StoreError>;

    async fn insert_identity(&self, identity: &Identity) -> Result<(), StoreError>;

    async fn update_identity(&self, identity: &Identity) -> Result<(), StoreError>;

    // API keys

    async fn insert_api_key(&self, key: &ApiKey) -> Result<(), StoreError>;

    /// Owner of the key with this hash, if the key exists and is unexpired at `now`.
    async fn find_identity_by_api_key(
        &self,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Identity>, StoreError>;

    // Refresh tokens

    /// Persist a token; the store assigns the next `seq`.
    async fn insert_refresh_token(&self, token: NewRefreshToken) -> Result<RefreshToken, StoreError>;

    async fn find_refresh_token_with_owner(
        &self,
        token_hash: &str,
    ) -> Result<Option<(RefreshToken, Identity)>, StoreError>;

    async fn find_refresh_token_by_id(&self, id: Uuid) -> Result<Option<RefreshToken>, StoreError>;

    /// Atomically cap `expires_at` at `not_after`, only while the row is
    /// unrevoked and unexpired at `now`. Returns the updated row, or `None`
    /// when the condition did not hold.
    async fn soft_expire_refresh_token(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Option<RefreshToken>, StoreError>;

    /// Cap `expires_at` at `not_after` for every live token of the lineage
    /// except the one with the highest `seq`. Returns the number of rows touched.
    async fn supersede_lineage(
        &self,
        lineage_id: Uuid,
        now: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Set `revoked` on every token of the lineage.
    async fn revoke_lineage(&self, lineage_id: Uuid) -> Result<u64, StoreError>;

    /// Tokens matching `filter`, restricted to live ones when `live_at` is set.
    async fn list_refresh_tokens(
        &self,
        filter: &Filter,
        live_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<RefreshToken>, StoreError>;

    async fn delete_refresh_token_by_hash(&self, token_hash: &str) -> Result<bool, StoreError>;

    /// Delete rows that are revoked or expired at `now`, optionally only for `owners`.
    async fn delete_terminal_refresh_tokens(
        &self,
        now: DateTime<Utc>,
        owners: Option<&[Uuid]>,
    ) -> Result<u64, StoreError>;
}
