//! Refresh-token rotation.
//!
//! A presented token is soft-expired (its expiry capped at now + grace)
//! rather than revoked, so requests racing on the same cookie all succeed
//! while the window lasts. After each successor is stored, every older live
//! token of the lineage is capped the same way, leaving one survivor once
//! the window has passed.
//!
//! A dead token whose lineage still has a live member is reported as
//! superseded: a late request carrying the old cookie must not end the
//! session the client holds through the successor.
//!
//! Capping the old token and storing the successor are separate statements.
//! A request cancelled between them loses the session when the window ends.

use chrono::Duration;
use std::sync::Arc;

use super::clock::Clock;
use super::error::RotationError;
use super::token_issuer::{ClientInfo, TokenIssuer, TokenPair};
use crate::authz::{Field, Filter, Predicate};
use crate::models::{Identity, RefreshToken, TokenState};
use crate::store::{with_deadline, IdentityStore};

/// Result of a successful rotation.
#[derive(Debug)]
pub struct Rotated {
    pub identity: Identity,
    pub pair: TokenPair,
}

pub struct RotationCoordinator {
    store: Arc<dyn IdentityStore>,
    issuer: Arc<TokenIssuer>,
    clock: Arc<dyn Clock>,
    grace: Duration,
    store_timeout: std::time::Duration,
}

impl RotationCoordinator {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        issuer: Arc<TokenIssuer>,
        clock: Arc<dyn Clock>,
        grace: Duration,
        store_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            issuer,
            clock,
            grace,
            store_timeout,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Exchange a raw refresh token for a new pair bound to the same identity.
    pub async fn rotate(&self, raw_token: &str, client: &ClientInfo) -> Result<Rotated, RotationError> {
        let result = self.try_rotate(raw_token, client).await;
        let outcome = match &result {
            Ok(_) => "rotated",
            Err(e) => e.outcome(),
        };
        metrics::counter!("session_rotations_total", "outcome" => outcome).increment(1);
        result
    }

    async fn try_rotate(&self, raw_token: &str, client: &ClientInfo) -> Result<Rotated, RotationError> {
        let hash = RefreshToken::hash_token(raw_token);

        let (current, owner) = with_deadline(
            self.store_timeout,
            self.store.find_refresh_token_with_owner(&hash),
        )
        .await?
        .ok_or(RotationError::NotFound)?;

        let now = self.clock.now();
        if let Err(e) = Self::ensure_live(&current, now) {
            return Err(self.classify_dead(&current, e, now).await?);
        }

        let not_after = now + self.grace;
        let capped = with_deadline(
            self.store_timeout,
            self.store.soft_expire_refresh_token(current.id, now, not_after),
        )
        .await?;
        if capped.is_none() {
            // Another request moved the row to a terminal state first.
            return Err(self.reread_failure(&hash, now).await?);
        }

        let pair = self
            .issuer
            .create_refresh_token_pair(
                &owner,
                client,
                Some(current.created_at),
                Some(current.lineage_id),
            )
            .await?;

        match with_deadline(
            self.store_timeout,
            self.store.supersede_lineage(current.lineage_id, now, not_after),
        )
        .await
        {
            Ok(superseded) => tracing::debug!(
                lineage_id = %current.lineage_id,
                superseded,
                "Lineage superseded"
            ),
            // The successor is stored; the next rotation of this lineage caps
            // the stragglers.
            Err(e) => tracing::warn!(
                lineage_id = %current.lineage_id,
                error = %e,
                "Failed to supersede older lineage tokens"
            ),
        }

        tracing::info!(
            identity_id = %owner.id,
            lineage_id = %current.lineage_id,
            old_token = %current.hash_prefix(),
            new_token = %pair.refresh.hash_prefix(),
            "Refresh token rotated"
        );

        Ok(Rotated {
            identity: owner,
            pair,
        })
    }

    fn ensure_live(token: &RefreshToken, now: chrono::DateTime<chrono::Utc>) -> Result<(), RotationError> {
        match token.state_at(now) {
            TokenState::Live => Ok(()),
            TokenState::Revoked => Err(RotationError::Revoked),
            TokenState::Expired => Err(RotationError::Expired),
        }
    }

    async fn reread_failure(
        &self,
        hash: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<RotationError, RotationError> {
        let row = with_deadline(self.store_timeout, self.store.find_refresh_token_with_owner(hash)).await?;
        Ok(match row {
            None => RotationError::NotFound,
            Some((token, _)) => {
                let dead = Self::ensure_live(&token, now).err().unwrap_or(RotationError::Revoked);
                self.classify_dead(&token, dead, now).await?
            }
        })
    }

    async fn classify_dead(
        &self,
        token: &RefreshToken,
        dead: RotationError,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<RotationError, RotationError> {
        let lineage = Filter::new().with(Predicate::Eq(Field::LineageId, token.lineage_id));
        let live = with_deadline(
            self.store_timeout,
            self.store.list_refresh_tokens(&lineage, Some(now)),
        )
        .await?;
        if live.iter().any(|t| t.id != token.id) {
            Ok(RotationError::Superseded)
        } else {
            Ok(dead)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JwtConfig;
    use crate::models::Role;
    use crate::services::clock::ManualClock;
    use crate::store::MemoryIdentityStore;
    use chrono::Utc;
    use secrecy::Secret;

    struct Fixture {
        clock: ManualClock,
        store: Arc<MemoryIdentityStore>,
        issuer: Arc<TokenIssuer>,
        rotation: RotationCoordinator,
        identity: Identity,
    }

    async fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let store = Arc::new(MemoryIdentityStore::new());
        let config = JwtConfig {
            signing_key: Secret::new("0123456789abcdef0123456789abcdef".to_string()),
            issuer: "identity-service".into(),
            audience: "community-platform".into(),
            access_token_expiry_minutes: 60,
            refresh_token_expiry_days: 365,
            leeway_seconds: 0,
        };
        let timeout = std::time::Duration::from_secs(1);
        let issuer = Arc::new(TokenIssuer::new(&config, store.clone(), Arc::new(clock.clone()), timeout));
        let rotation = RotationCoordinator::new(
            store.clone(),
            issuer.clone(),
            Arc::new(clock.clone()),
            Duration::seconds(60),
            timeout,
        );
        let identity = Identity::new("sub".into(), "name".into(), Role::User, clock.now());
        store.insert_identity(&identity).await.unwrap();
        Fixture {
            clock,
            store,
            issuer,
            rotation,
            identity,
        }
    }

    #[tokio::test]
    async fn test_unknown_token_is_not_found() {
        let f = fixture().await;
        let err = f.rotation.rotate("nope", &ClientInfo::default()).await.unwrap_err();
        assert!(matches!(err, RotationError::NotFound));
    }

    #[tokio::test]
    async fn test_rotation_preserves_session_creation_time() {
        let f = fixture().await;
        let login = f
            .issuer
            .create_refresh_token_pair(&f.identity, &ClientInfo::default(), None, None)
            .await
            .unwrap();

        f.clock.advance(Duration::hours(2));
        let rotated = f
            .rotation
            .rotate(&login.refresh_token, &ClientInfo::default())
            .await
            .unwrap();

        assert_eq!(rotated.identity.id, f.identity.id);
        assert_eq!(rotated.pair.refresh.created_at, login.refresh.created_at);
        assert_eq!(rotated.pair.refresh.lineage_id, login.refresh.lineage_id);
        assert!(rotated.pair.refresh.issued_at > login.refresh.issued_at);
        assert_ne!(rotated.pair.refresh_token, login.refresh_token);
    }

    #[tokio::test]
    async fn test_revoked_token_fails_closed() {
        let f = fixture().await;
        let login = f
            .issuer
            .create_refresh_token_pair(&f.identity, &ClientInfo::default(), None, None)
            .await
            .unwrap();
        f.store.revoke_lineage(login.refresh.lineage_id).await.unwrap();

        let err = f
            .rotation
            .rotate(&login.refresh_token, &ClientInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::Revoked));
        assert_eq!(f.store.refresh_tokens().len(), 1);
    }

    #[tokio::test]
    async fn test_rotated_token_reads_as_superseded_while_successor_lives() {
        let f = fixture().await;
        let login = f
            .issuer
            .create_refresh_token_pair(&f.identity, &ClientInfo::default(), None, None)
            .await
            .unwrap();
        f.rotation
            .rotate(&login.refresh_token, &ClientInfo::default())
            .await
            .unwrap();

        f.clock.advance(Duration::seconds(61));
        let err = f
            .rotation
            .rotate(&login.refresh_token, &ClientInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::Superseded));
        assert!(err.is_terminal());
        assert!(!err.ends_session());
    }

    #[tokio::test]
    async fn test_expired_token_without_successor_ends_session() {
        let f = fixture().await;
        let login = f
            .issuer
            .create_refresh_token_pair(&f.identity, &ClientInfo::default(), None, None)
            .await
            .unwrap();

        f.clock.advance(Duration::days(366));
        let err = f
            .rotation
            .rotate(&login.refresh_token, &ClientInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::Expired));
        assert!(err.ends_session());
    }
}
