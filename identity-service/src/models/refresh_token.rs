use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Persisted refresh token. Only the SHA-256 hash of the raw secret is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshToken {
    pub id: Uuid,
    pub owner_id: Uuid,
    /// Id of the first token of the login session; shared by every rotation.
    pub lineage_id: Uuid,
    /// Store-assigned, strictly increasing issue order.
    pub seq: i64,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    /// Creation time of the login session this token descends from.
    pub created_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Lifecycle state of a refresh token at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Live,
    Revoked,
    Expired,
}

impl RefreshToken {
    /// Hash a raw refresh token using SHA-256.
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> TokenState {
        if self.revoked {
            TokenState::Revoked
        } else if self.expires_at <= now {
            TokenState::Expired
        } else {
            TokenState::Live
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.state_at(now) == TokenState::Live
    }

    /// Short hash prefix, safe for logs.
    pub fn hash_prefix(&self) -> &str {
        Self::prefix_of(&self.token_hash)
    }

    /// Short, log-safe prefix of a token hash.
    pub fn prefix_of(hash: &str) -> &str {
        &hash[..hash.len().min(8)]
    }
}

/// Refresh token row about to be inserted; the store assigns `seq`.
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub lineage_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl NewRefreshToken {
    pub fn into_token(self, seq: i64) -> RefreshToken {
        RefreshToken {
            id: self.id,
            owner_id: self.owner_id,
            lineage_id: self.lineage_id,
            seq,
            token_hash: self.token_hash,
            expires_at: self.expires_at,
            revoked: false,
            created_at: self.created_at,
            issued_at: self.issued_at,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
        }
    }
}

/// Session info for API responses.
#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl From<RefreshToken> for SessionInfo {
    fn from(t: RefreshToken) -> Self {
        Self {
            session_id: t.id,
            owner_id: t.owner_id,
            created_at: t.created_at,
            issued_at: t.issued_at,
            expires_at: t.expires_at,
            ip_address: t.ip_address,
            user_agent: t.user_agent,
        }
    }
}
