use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Long-lived machine credential owned by an identity.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub owner_id: Uuid,
    /// SHA-256 of the key material, used for lookup.
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub expires_on: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn new(owner_id: Uuid, raw_key: &str, expires_on: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            key_hash: Self::hash_key(raw_key),
            expires_on,
            created_at: now,
        }
    }

    pub fn hash_key(raw_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(raw_key.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_on <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_api_key_expiry() {
        let now = Utc::now();
        let key = ApiKey::new(Uuid::new_v4(), "ak_secret", now + Duration::days(1), now);
        assert!(!key.is_expired_at(now));
        assert!(key.is_expired_at(now + Duration::days(1)));
        assert_ne!(key.key_hash, "ak_secret");
    }
}
