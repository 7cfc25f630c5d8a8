use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Duration;
use rand::{rngs::OsRng, RngCore};
use std::sync::Arc;
use uuid::Uuid;

use super::clock::Clock;
use super::error::ServiceError;
use super::token_issuer::{ClientInfo, TokenIssuer, TokenPair};
use crate::authz::{
    AuthorizationEngine, AuthzError, EntityKind, Operation, OperationKind, RequestContext,
};
use crate::models::{ApiKey, Identity, ProviderUserInfo, RefreshToken, Role};
use crate::store::{with_deadline, IdentityStore};

const API_KEY_PREFIX: &str = "ak_";
const API_KEY_BYTES: usize = 32;

/// Result of a completed external login.
#[derive(Debug)]
pub struct LoginOutcome {
    pub identity: Identity,
    pub created: bool,
    pub pair: TokenPair,
}

/// A new API key. `raw_key` is never retrievable again.
#[derive(Debug)]
pub struct CreatedApiKey {
    pub key: ApiKey,
    pub raw_key: String,
}

/// Identity and credential operations, each authorized through the engine.
pub struct IdentityService {
    store: Arc<dyn IdentityStore>,
    issuer: Arc<TokenIssuer>,
    engine: Arc<AuthorizationEngine>,
    clock: Arc<dyn Clock>,
    store_timeout: std::time::Duration,
}

impl IdentityService {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        issuer: Arc<TokenIssuer>,
        engine: Arc<AuthorizationEngine>,
        clock: Arc<dyn Clock>,
        store_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            issuer,
            engine,
            clock,
            store_timeout,
        }
    }

    fn caller(ctx: &RequestContext) -> Result<&Identity, ServiceError> {
        ctx.identity()
            .ok_or(ServiceError::Authz(AuthzError::Unauthenticated))
    }

    /// Find or register the identity behind a completed provider login and
    /// open a new session for it.
    pub async fn complete_login(
        &self,
        info: ProviderUserInfo,
        client: &ClientInfo,
    ) -> Result<LoginOutcome, ServiceError> {
        let ctx = RequestContext::oauth_flow(info.subject.clone());
        let now = self.clock.now();

        let existing = with_deadline(
            self.store_timeout,
            self.store.find_identity_by_external_id(&info.subject),
        )
        .await?;

        let (identity, created) = match existing {
            None => {
                let role = if info.email_verified { Role::User } else { Role::Guest };
                let mut identity =
                    Identity::new(info.subject.clone(), info.preferred_username.clone(), role, now);
                identity.email = info.email.clone();
                identity.profile_image = info.profile_image.clone();

                self.engine.authorize(
                    &ctx,
                    Operation::mutation(EntityKind::Identity, OperationKind::Create)
                        .targeting_owner(identity.id)
                        .targeting_subject(&info.subject),
                )?;
                with_deadline(self.store_timeout, self.store.insert_identity(&identity)).await?;
                tracing::info!(identity_id = %identity.id, role = %identity.role, "Identity registered");
                (identity, true)
            }
            Some(mut identity) => {
                if Self::sync_profile(&mut identity, &info) {
                    identity.updated_at = now;
                    self.engine.authorize(
                        &ctx,
                        Operation::mutation(EntityKind::Identity, OperationKind::UpdateOne)
                            .targeting_owner(identity.id)
                            .targeting_subject(&info.subject),
                    )?;
                    with_deadline(self.store_timeout, self.store.update_identity(&identity)).await?;
                    tracing::info!(identity_id = %identity.id, role = %identity.role, "Identity profile synced");
                }
                (identity, false)
            }
        };

        self.engine.authorize(
            &ctx.with_identity(identity.clone()),
            Operation::mutation(EntityKind::RefreshToken, OperationKind::Create)
                .targeting_owner(identity.id)
                .targeting_subject(&info.subject),
        )?;
        let pair = self
            .issuer
            .create_refresh_token_pair(&identity, client, None, None)
            .await?;

        Ok(LoginOutcome {
            identity,
            created,
            pair,
        })
    }

    /// Apply provider data to a stored identity. Returns whether anything changed.
    fn sync_profile(identity: &mut Identity, info: &ProviderUserInfo) -> bool {
        let mut changed = false;
        if identity.role == Role::Guest && info.email_verified {
            identity.role = Role::User;
            changed = true;
        }
        if identity.display_name != info.preferred_username {
            identity.display_name = info.preferred_username.clone();
            changed = true;
        }
        if info.profile_image.is_some() && identity.profile_image != info.profile_image {
            identity.profile_image = info.profile_image.clone();
            changed = true;
        }
        if info.email.is_some() && identity.email != info.email {
            identity.email = info.email.clone();
            changed = true;
        }
        changed
    }

    pub async fn find_by_external_id(
        &self,
        ctx: &RequestContext,
        external_id: &str,
    ) -> Result<Option<Identity>, ServiceError> {
        self.engine.authorize(ctx, Operation::query(EntityKind::Identity))?;
        Ok(with_deadline(
            self.store_timeout,
            self.store.find_identity_by_external_id(external_id),
        )
        .await?)
    }

    /// Resolve the owner of a raw API key, if the key exists and is unexpired.
    pub async fn resolve_api_key(&self, raw_key: &str) -> Result<Option<Identity>, ServiceError> {
        self.engine
            .authorize(&RequestContext::system(), Operation::query(EntityKind::ApiKey))?;
        let hash = ApiKey::hash_key(raw_key);
        Ok(with_deadline(
            self.store_timeout,
            self.store.find_identity_by_api_key(&hash, self.clock.now()),
        )
        .await?)
    }

    pub async fn create_api_key(
        &self,
        ctx: &RequestContext,
        expires_in_days: i64,
    ) -> Result<CreatedApiKey, ServiceError> {
        if expires_in_days <= 0 {
            return Err(ServiceError::Validation(
                "expires_in_days must be positive".to_string(),
            ));
        }
        let caller = Self::caller(ctx)?;
        self.engine.authorize(
            ctx,
            Operation::mutation(EntityKind::ApiKey, OperationKind::Create).targeting_owner(caller.id),
        )?;

        let mut bytes = [0u8; API_KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let raw_key = format!("{}{}", API_KEY_PREFIX, URL_SAFE_NO_PAD.encode(bytes));

        let now = self.clock.now();
        let key = ApiKey::new(caller.id, &raw_key, now + Duration::days(expires_in_days), now);
        with_deadline(self.store_timeout, self.store.insert_api_key(&key)).await?;

        tracing::info!(identity_id = %caller.id, api_key_id = %key.id, "API key created");
        Ok(CreatedApiKey { key, raw_key })
    }

    /// Change another identity's role. The caller must outrank the target's
    /// current role and hold at least the role being granted.
    pub async fn change_role(
        &self,
        ctx: &RequestContext,
        target_id: Uuid,
        new_role: Role,
    ) -> Result<Identity, ServiceError> {
        let caller = Self::caller(ctx)?;
        let mut target = with_deadline(self.store_timeout, self.store.find_identity_by_id(target_id))
            .await?
            .ok_or(ServiceError::NotFound("Identity"))?;

        self.engine.authorize(
            ctx,
            Operation::mutation(EntityKind::Identity, OperationKind::UpdateOne)
                .targeting_owner(target.id)
                .targeting_subject(&target.external_id),
        )?;

        if caller.id == target.id {
            return Err(ServiceError::Forbidden("cannot change own role".to_string()));
        }
        let ranks = self.engine.ranks();
        if !ranks.outranks(caller.role, target.role) || !ranks.is_authorized(Some(caller), new_role) {
            tracing::info!(
                caller = %caller.id,
                target = %target.id,
                from = %target.role,
                to = %new_role,
                "Role change rejected"
            );
            return Err(ServiceError::Forbidden(format!(
                "insufficient rank to set role {}",
                new_role
            )));
        }

        target.role = new_role;
        target.updated_at = self.clock.now();
        with_deadline(self.store_timeout, self.store.update_identity(&target)).await?;

        tracing::info!(caller = %caller.id, target = %target.id, role = %new_role, "Role changed");
        Ok(target)
    }

    /// Live sessions visible to the caller.
    pub async fn list_sessions(&self, ctx: &RequestContext) -> Result<Vec<RefreshToken>, ServiceError> {
        let op = self
            .engine
            .authorize(ctx, Operation::query(EntityKind::RefreshToken))?;
        Ok(with_deadline(
            self.store_timeout,
            self.store.list_refresh_tokens(&op.filter, Some(self.clock.now())),
        )
        .await?)
    }

    /// Revoke every token of the session `session_id` belongs to.
    pub async fn revoke_session(&self, ctx: &RequestContext, session_id: Uuid) -> Result<(), ServiceError> {
        let token = with_deadline(self.store_timeout, self.store.find_refresh_token_by_id(session_id))
            .await?
            .ok_or(ServiceError::NotFound("Session"))?;

        self.engine.authorize(
            ctx,
            Operation::mutation(EntityKind::RefreshToken, OperationKind::DeleteOne)
                .targeting_owner(token.owner_id),
        )?;

        let revoked = with_deadline(self.store_timeout, self.store.revoke_lineage(token.lineage_id)).await?;
        tracing::info!(
            lineage_id = %token.lineage_id,
            caller = ?ctx.identity().map(|i| i.id),
            revoked,
            "Session revoked"
        );
        Ok(())
    }

    /// Delete the presented refresh token. Returns whether a row was removed.
    pub async fn sign_out(&self, raw_refresh_token: &str) -> Result<bool, ServiceError> {
        self.engine.authorize(
            &RequestContext::system(),
            Operation::mutation(EntityKind::RefreshToken, OperationKind::DeleteOne),
        )?;
        let hash = RefreshToken::hash_token(raw_refresh_token);
        let deleted = with_deadline(
            self.store_timeout,
            self.store.delete_refresh_token_by_hash(&hash),
        )
        .await?;
        tracing::info!(token = %RefreshToken::prefix_of(&hash), deleted, "Refresh token signed out");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JwtConfig;
    use crate::services::clock::ManualClock;
    use crate::store::MemoryIdentityStore;
    use chrono::Utc;
    use secrecy::Secret;

    fn service() -> (IdentityService, Arc<MemoryIdentityStore>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
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
        let issuer = Arc::new(TokenIssuer::new(&config, store.clone(), clock.clone(), timeout));
        let service = IdentityService::new(
            store.clone(),
            issuer,
            Arc::new(AuthorizationEngine::standard()),
            clock,
            timeout,
        );
        (service, store)
    }

    fn provider_user(verified: bool) -> ProviderUserInfo {
        ProviderUserInfo {
            subject: "twitch|42".into(),
            preferred_username: "caramel".into(),
            email: Some("caramel@example.com".into()),
            email_verified: verified,
            profile_image: None,
        }
    }

    #[tokio::test]
    async fn test_unverified_login_registers_guest_then_upgrades() {
        let (service, _) = service();
        let first = service
            .complete_login(provider_user(false), &ClientInfo::default())
            .await
            .unwrap();
        assert!(first.created);
        assert_eq!(first.identity.role, Role::Guest);

        let second = service
            .complete_login(provider_user(true), &ClientInfo::default())
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.identity.id, first.identity.id);
        assert_eq!(second.identity.role, Role::User);
        assert_ne!(second.pair.refresh.lineage_id, first.pair.refresh.lineage_id);
    }

    #[tokio::test]
    async fn test_role_change_requires_outranking() {
        let (service, store) = service();
        let now = Utc::now();
        let admin = Identity::new("a".into(), "admin".into(), Role::Admin, now);
        let moderator = Identity::new("m".into(), "mod".into(), Role::Moderator, now);
        let user = Identity::new("u".into(), "user".into(), Role::User, now);
        for i in [&admin, &moderator, &user] {
            store.insert_identity(i).await.unwrap();
        }

        let as_admin = RequestContext::authenticated(admin.clone());
        let promoted = service
            .change_role(&as_admin, user.id, Role::Moderator)
            .await
            .unwrap();
        assert_eq!(promoted.role, Role::Moderator);

        // A moderator is not an admin, so the identity chain denies.
        let as_mod = RequestContext::authenticated(moderator.clone());
        assert!(matches!(
            service.change_role(&as_mod, user.id, Role::Guest).await,
            Err(ServiceError::Authz(AuthzError::Denied(_)))
        ));

        assert!(matches!(
            service.change_role(&as_admin, admin.id, Role::User).await,
            Err(ServiceError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_api_key_requires_identity() {
        let (service, _) = service();
        assert!(matches!(
            service.create_api_key(&RequestContext::anonymous(), 30).await,
            Err(ServiceError::Authz(AuthzError::Unauthenticated))
        ));
    }

    #[tokio::test]
    async fn test_api_key_resolves_owner() {
        let (service, store) = service();
        let owner = Identity::new("k".into(), "keyholder".into(), Role::User, Utc::now());
        store.insert_identity(&owner).await.unwrap();

        let created = service
            .create_api_key(&RequestContext::authenticated(owner.clone()), 30)
            .await
            .unwrap();
        assert!(created.raw_key.starts_with(API_KEY_PREFIX));
        let resolved = service.resolve_api_key(&created.raw_key).await.unwrap();
        assert_eq!(resolved.map(|i| i.id), Some(owner.id));
        assert!(service.resolve_api_key("ak_unknown").await.unwrap().is_none());
    }
}
