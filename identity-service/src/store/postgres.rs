//! PostgreSQL identity store.
//!
//! Uses sqlx runtime queries; every conditional transition is a single
//! statement so concurrent requests serialize on the row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{FromRow, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{IdentityStore, StoreError};
use crate::authz::Filter;
use crate::models::{ApiKey, Identity, NewRefreshToken, RefreshToken, Role};

const IDENTITY_COLUMNS: &str =
    "id, external_id, display_name, role_code, email, profile_image, created_at, updated_at";

const TOKEN_COLUMNS: &str = "id, owner_id, lineage_id, seq, token_hash, expires_at, revoked, \
     created_at, issued_at, ip_address, user_agent";

#[derive(Debug, FromRow)]
struct IdentityRow {
    id: Uuid,
    external_id: String,
    display_name: String,
    role_code: String,
    email: Option<String>,
    profile_image: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IdentityRow> for Identity {
    type Error = StoreError;

    fn try_from(row: IdentityRow) -> Result<Self, Self::Error> {
        let role: Role = row
            .role_code
            .parse()
            .map_err(|_| StoreError::InvalidRow(format!("unknown role {}", row.role_code)))?;
        Ok(Identity {
            id: row.id,
            external_id: row.external_id,
            display_name: row.display_name,
            role,
            email: row.email,
            profile_image: row.profile_image,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RefreshTokenRow {
    id: Uuid,
    owner_id: Uuid,
    lineage_id: Uuid,
    seq: i64,
    token_hash: String,
    expires_at: DateTime<Utc>,
    revoked: bool,
    created_at: DateTime<Utc>,
    issued_at: DateTime<Utc>,
    ip_address: Option<String>,
    user_agent: Option<String>,
}

impl From<RefreshTokenRow> for RefreshToken {
    fn from(row: RefreshTokenRow) -> Self {
        RefreshToken {
            id: row.id,
            owner_id: row.owner_id,
            lineage_id: row.lineage_id,
            seq: row.seq,
            token_hash: row.token_hash,
            expires_at: row.expires_at,
            revoked: row.revoked,
            created_at: row.created_at,
            issued_at: row.issued_at,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
        }
    }
}

/// Token joined with its owner; owner columns are prefixed to avoid clashes.
#[derive(Debug, FromRow)]
struct TokenWithOwnerRow {
    #[sqlx(flatten)]
    token: RefreshTokenRow,
    owner_external_id: String,
    owner_display_name: String,
    owner_role_code: String,
    owner_email: Option<String>,
    owner_profile_image: Option<String>,
    owner_created_at: DateTime<Utc>,
    owner_updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PostgresIdentityStore {
    pool: PgPool,
}

impl PostgresIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl IdentityStore for PostgresIdentityStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(|e| {
            tracing::error!("Database health check failed: {}", e);
            StoreError::from(e)
        })?;
        Ok(())
    }

    async fn find_identity_by_id(&self, id: Uuid) -> Result<Option<Identity>, StoreError> {
        sqlx::query_as::<_, IdentityRow>(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Identity::try_from)
        .transpose()
    }

    async fn find_identity_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Identity>, StoreError> {
        sqlx::query_as::<_, IdentityRow>(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Identity::try_from)
        .transpose()
    }

    async fn insert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO identities (id, external_id, display_name, role_code, email, profile_image, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(identity.id)
        .bind(&identity.external_id)
        .bind(&identity.display_name)
        .bind(identity.role.as_str())
        .bind(&identity.email)
        .bind(&identity.profile_image)
        .bind(identity.created_at)
        .bind(identity.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE identities
            SET display_name = $2, role_code = $3, email = $4, profile_image = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(identity.id)
        .bind(&identity.display_name)
        .bind(identity.role.as_str())
        .bind(&identity.email)
        .bind(&identity.profile_image)
        .bind(identity.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidRow(format!(
                "identity {} does not exist",
                identity.id
            )));
        }
        Ok(())
    }

    async fn insert_api_key(&self, key: &ApiKey) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (id, owner_id, key_hash, expires_on, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(key.id)
        .bind(key.owner_id)
        .bind(&key.key_hash)
        .bind(key.expires_on)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_identity_by_api_key(
        &self,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Identity>, StoreError> {
        sqlx::query_as::<_, IdentityRow>(
            r#"
            SELECT i.id, i.external_id, i.display_name, i.role_code, i.email, i.profile_image,
                   i.created_at, i.updated_at
            FROM api_keys k
            JOIN identities i ON i.id = k.owner_id
            WHERE k.key_hash = $1 AND k.expires_on > $2
            "#,
        )
        .bind(key_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(Identity::try_from)
        .transpose()
    }

    async fn insert_refresh_token(&self, token: NewRefreshToken) -> Result<RefreshToken, StoreError> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO refresh_tokens
                (id, owner_id, lineage_id, token_hash, expires_at, revoked, created_at, issued_at, ip_address, user_agent)
            VALUES ($1, $2, $3, $4, $5, FALSE, $6, $7, $8, $9)
            RETURNING seq
            "#,
        )
        .bind(token.id)
        .bind(token.owner_id)
        .bind(token.lineage_id)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .bind(token.created_at)
        .bind(token.issued_at)
        .bind(&token.ip_address)
        .bind(&token.user_agent)
        .fetch_one(&self.pool)
        .await?;

        Ok(token.into_token(seq))
    }

    async fn find_refresh_token_with_owner(
        &self,
        token_hash: &str,
    ) -> Result<Option<(RefreshToken, Identity)>, StoreError> {
        let row = sqlx::query_as::<_, TokenWithOwnerRow>(
            r#"
            SELECT t.id, t.owner_id, t.lineage_id, t.seq, t.token_hash, t.expires_at, t.revoked,
                   t.created_at, t.issued_at, t.ip_address, t.user_agent,
                   i.external_id AS owner_external_id,
                   i.display_name AS owner_display_name,
                   i.role_code AS owner_role_code,
                   i.email AS owner_email,
                   i.profile_image AS owner_profile_image,
                   i.created_at AS owner_created_at,
                   i.updated_at AS owner_updated_at
            FROM refresh_tokens t
            JOIN identities i ON i.id = t.owner_id
            WHERE t.token_hash = $1
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let owner = Identity::try_from(IdentityRow {
            id: row.token.owner_id,
            external_id: row.owner_external_id,
            display_name: row.owner_display_name,
            role_code: row.owner_role_code,
            email: row.owner_email,
            profile_image: row.owner_profile_image,
            created_at: row.owner_created_at,
            updated_at: row.owner_updated_at,
        })?;
        Ok(Some((row.token.into(), owner)))
    }

    async fn find_refresh_token_by_id(&self, id: Uuid) -> Result<Option<RefreshToken>, StoreError> {
        let row = sqlx::query_as::<_, RefreshTokenRow>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn soft_expire_refresh_token(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Option<RefreshToken>, StoreError> {
        let row = sqlx::query_as::<_, RefreshTokenRow>(&format!(
            r#"
            UPDATE refresh_tokens
            SET expires_at = LEAST(expires_at, $3)
            WHERE id = $1 AND revoked = FALSE AND expires_at > $2
            RETURNING {TOKEN_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(now)
        .bind(not_after)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn supersede_lineage(
        &self,
        lineage_id: Uuid,
        now: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET expires_at = LEAST(expires_at, $3)
            WHERE lineage_id = $1
              AND revoked = FALSE
              AND expires_at > $2
              AND seq < (SELECT MAX(seq) FROM refresh_tokens WHERE lineage_id = $1)
            "#,
        )
        .bind(lineage_id)
        .bind(now)
        .bind(not_after)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_lineage(&self, lineage_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE lineage_id = $1 AND revoked = FALSE",
        )
        .bind(lineage_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_refresh_tokens(
        &self,
        filter: &Filter,
        live_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<RefreshToken>, StoreError> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {TOKEN_COLUMNS} FROM refresh_tokens"));
        if let Some(now) = live_at {
            qb.push(" WHERE revoked = FALSE AND expires_at > ");
            qb.push_bind(now);
        }
        filter.push_sql(&mut qb, live_at.is_some());
        qb.push(" ORDER BY seq");

        let rows = qb
            .build_query_as::<RefreshTokenRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_refresh_token_by_hash(&self, token_hash: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_terminal_refresh_tokens(
        &self,
        now: DateTime<Utc>,
        owners: Option<&[Uuid]>,
    ) -> Result<u64, StoreError> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("DELETE FROM refresh_tokens WHERE (revoked = TRUE OR expires_at <= ");
        qb.push_bind(now);
        qb.push(")");
        if let Some(owners) = owners {
            qb.push(" AND owner_id = ANY(");
            qb.push_bind(owners.to_vec());
            qb.push(")");
        }

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
