use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{IdentityStore, StoreError};
use crate::authz::Filter;
use crate::models::{ApiKey, Identity, NewRefreshToken, RefreshToken};

#[derive(Default)]
struct State {
    identities: HashMap<Uuid, Identity>,
    api_keys: HashMap<String, ApiKey>,
    refresh_tokens: HashMap<Uuid, RefreshToken>,
    next_seq: i64,
}

/// In-process store for tests and local development.
///
/// Every method takes the lock once, so each call is atomic with respect to
/// the others, matching the single-statement guarantees of the SQL store.
#[derive(Default)]
pub struct MemoryIdentityStore {
    state: Mutex<State>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Transient(anyhow::anyhow!("memory store lock poisoned")))
    }

    /// Every stored refresh token, in issue order.
    pub fn refresh_tokens(&self) -> Vec<RefreshToken> {
        let mut tokens: Vec<_> = match self.state.lock() {
            Ok(state) => state.refresh_tokens.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        tokens.sort_by_key(|t| t.seq);
        tokens
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    async fn find_identity_by_id(&self, id: Uuid) -> Result<Option<Identity>, StoreError> {
        Ok(self.lock()?.identities.get(&id).cloned())
    }

    async fn find_identity_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .lock()?
            .identities
            .values()
            .find(|i| i.external_id == external_id)
            .cloned())
    }

    async fn insert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state
            .identities
            .values()
            .any(|i| i.id == identity.id || i.external_id == identity.external_id)
        {
            return Err(StoreError::Conflict(format!(
                "identity {} already exists",
                identity.external_id
            )));
        }
        state.identities.insert(identity.id, identity.clone());
        Ok(())
    }

    async fn update_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        match state.identities.get_mut(&identity.id) {
            Some(existing) => {
                *existing = identity.clone();
                Ok(())
            }
            None => Err(StoreError::InvalidRow(format!(
                "identity {} does not exist",
                identity.id
            ))),
        }
    }

    async fn insert_api_key(&self, key: &ApiKey) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.api_keys.contains_key(&key.key_hash) {
            return Err(StoreError::Conflict("api key hash already exists".to_string()));
        }
        state.api_keys.insert(key.key_hash.clone(), key.clone());
        Ok(())
    }

    async fn find_identity_by_api_key(
        &self,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Identity>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .api_keys
            .get(key_hash)
            .filter(|k| !k.is_expired_at(now))
            .and_then(|k| state.identities.get(&k.owner_id))
            .cloned())
    }

    async fn insert_refresh_token(&self, token: NewRefreshToken) -> Result<RefreshToken, StoreError> {
        let mut state = self.lock()?;
        if !state.identities.contains_key(&token.owner_id) {
            return Err(StoreError::InvalidRow(format!(
                "owner {} does not exist",
                token.owner_id
            )));
        }
        if state
            .refresh_tokens
            .values()
            .any(|t| t.token_hash == token.token_hash)
        {
            return Err(StoreError::Conflict("token hash already exists".to_string()));
        }
        state.next_seq += 1;
        let stored = token.into_token(state.next_seq);
        state.refresh_tokens.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn find_refresh_token_with_owner(
        &self,
        token_hash: &str,
    ) -> Result<Option<(RefreshToken, Identity)>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .refresh_tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .and_then(|t| {
                state
                    .identities
                    .get(&t.owner_id)
                    .map(|owner| (t.clone(), owner.clone()))
            }))
    }

    async fn find_refresh_token_by_id(&self, id: Uuid) -> Result<Option<RefreshToken>, StoreError> {
        Ok(self.lock()?.refresh_tokens.get(&id).cloned())
    }

    async fn soft_expire_refresh_token(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Option<RefreshToken>, StoreError> {
        let mut state = self.lock()?;
        Ok(state
            .refresh_tokens
            .get_mut(&id)
            .filter(|t| t.is_valid_at(now))
            .map(|t| {
                t.expires_at = t.expires_at.min(not_after);
                t.clone()
            }))
    }

    async fn supersede_lineage(
        &self,
        lineage_id: Uuid,
        now: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let Some(newest) = state
            .refresh_tokens
            .values()
            .filter(|t| t.lineage_id == lineage_id)
            .map(|t| t.seq)
            .max()
        else {
            return Ok(0);
        };
        let mut touched = 0;
        for token in state.refresh_tokens.values_mut() {
            if token.lineage_id == lineage_id && token.seq < newest && token.is_valid_at(now) {
                token.expires_at = token.expires_at.min(not_after);
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn revoke_lineage(&self, lineage_id: Uuid) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let mut touched = 0;
        for token in state.refresh_tokens.values_mut() {
            if token.lineage_id == lineage_id && !token.revoked {
                token.revoked = true;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn list_refresh_tokens(
        &self,
        filter: &Filter,
        live_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<RefreshToken>, StoreError> {
        let state = self.lock()?;
        let mut tokens: Vec<_> = state
            .refresh_tokens
            .values()
            .filter(|t| live_at.map_or(true, |now| t.is_valid_at(now)))
            .filter(|t| filter.matches(*t))
            .cloned()
            .collect();
        tokens.sort_by_key(|t| t.seq);
        Ok(tokens)
    }

    async fn delete_refresh_token_by_hash(&self, token_hash: &str) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let before = state.refresh_tokens.len();
        state.refresh_tokens.retain(|_, t| t.token_hash != token_hash);
        Ok(state.refresh_tokens.len() < before)
    }

    async fn delete_terminal_refresh_tokens(
        &self,
        now: DateTime<Utc>,
        owners: Option<&[Uuid]>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let before = state.refresh_tokens.len();
        state.refresh_tokens.retain(|_, t| {
            let in_scope = owners.map_or(true, |o| o.contains(&t.owner_id));
            !(in_scope && !t.is_valid_at(now))
        });
        Ok((before - state.refresh_tokens.len()) as u64)
    }
}
