//! Shared fixtures for identity-service integration tests.
//!
//! Every test runs against the in-memory store and a manually advanced clock.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, Response},
    Router,
};
use chrono::{DateTime, Utc};
use identity_service::{
    authz::Filter,
    build_router,
    config::{
        CookieConfig, DatabaseConfig, Environment, IdentityConfig, JwtConfig, SecurityConfig,
        SessionConfig,
    },
    models::{ApiKey, Identity, NewRefreshToken, ProviderUserInfo, RefreshToken},
    services::{Clock, ClientInfo, LoginOutcome, ManualClock},
    store::{IdentityStore, MemoryIdentityStore, StoreError},
    AppState,
};
use secrecy::{Secret, SecretString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::util::ServiceExt;
use uuid::Uuid;

pub const REFRESH_COOKIE: &str = "rt";
pub const ACCESS_COOKIE: &str = "at";
pub const API_KEY_HEADER: &str = "x-api-key";

pub fn test_config() -> IdentityConfig {
    IdentityConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "identity-service".to_string(),
        service_version: "test".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: Secret::new("postgres://localhost/identity_test".to_string()),
            max_connections: 2,
            min_connections: 1,
        },
        jwt: JwtConfig {
            signing_key: SecretString::new("test-signing-key-0123456789abcdef".to_string()),
            issuer: "identity-service".to_string(),
            audience: "community-platform".to_string(),
            access_token_expiry_minutes: 60,
            refresh_token_expiry_days: 365,
            leeway_seconds: 0,
        },
        session: SessionConfig {
            rotation_grace_seconds: 60,
            cleanup_interval_seconds: 3600,
            store_timeout_ms: 200,
        },
        cookies: CookieConfig {
            domain: None,
            refresh_name: REFRESH_COOKIE.to_string(),
            access_name: ACCESS_COOKIE.to_string(),
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            api_key_header: API_KEY_HEADER.to_string(),
            trust_forwarded_for: true,
        },
    }
}

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub clock: ManualClock,
    pub memory: Arc<MemoryIdentityStore>,
}

impl TestApp {
    pub fn new() -> Self {
        let memory = Arc::new(MemoryIdentityStore::new());
        Self::with_store(memory.clone(), memory)
    }

    /// App over a `FaultyStore` wrapping a fresh memory store.
    pub fn faulty() -> (Self, Arc<FaultyStore>) {
        let memory = Arc::new(MemoryIdentityStore::new());
        let store = Arc::new(FaultyStore::new(memory.clone()));
        (Self::with_store(store.clone(), memory), store)
    }

    /// Build the app over `store`; `memory` is the backing store tests inspect.
    pub fn with_store(store: Arc<dyn IdentityStore>, memory: Arc<MemoryIdentityStore>) -> Self {
        let clock = ManualClock::new(Utc::now());
        let state = AppState::new(test_config(), store, Arc::new(clock.clone()), None);
        let router = build_router(state.clone());
        Self {
            state,
            router,
            clock,
            memory,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Complete a provider login for `subject` from `ip`.
    pub async fn login(&self, subject: &str, ip: &str) -> LoginOutcome {
        let info = ProviderUserInfo {
            subject: subject.to_string(),
            preferred_username: format!("{subject}-name"),
            email: Some(format!("{subject}@example.com")),
            email_verified: true,
            profile_image: None,
        };
        let client = ClientInfo {
            ip_address: Some(ip.to_string()),
            user_agent: Some("integration-test".to_string()),
        };
        self.state
            .identity
            .complete_login(info, &client)
            .await
            .expect("login")
    }

    /// Store an identity directly with the given role.
    pub async fn seed_identity(&self, subject: &str, role: identity_service::models::Role) -> Identity {
        let identity = Identity::new(subject.to_string(), subject.to_string(), role, self.now());
        self.memory.insert_identity(&identity).await.expect("seed identity");
        identity
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    /// Refresh tokens owned by `owner` that are valid right now.
    pub fn valid_tokens_of(&self, owner: Uuid) -> Vec<RefreshToken> {
        let now = self.now();
        self.memory
            .refresh_tokens()
            .into_iter()
            .filter(|t| t.owner_id == owner && t.is_valid_at(now))
            .collect()
    }
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

pub fn refresh_cookie(raw: &str) -> String {
    format!("{REFRESH_COOKIE}={raw}")
}

/// Value of the cookie `name` set by `response`, if any.
pub fn set_cookie<B>(response: &Response<B>, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&prefix))
        .map(|v| {
            v[prefix.len()..]
                .split(';')
                .next()
                .unwrap_or_default()
                .to_string()
        })
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

/// Store wrapper that injects faults into selected refresh-token calls.
///
/// While `hang` is set, inserts never complete. While `fail_supersede` or
/// `fail_deletes` is set, those calls return a transient error.
pub struct FaultyStore {
    pub inner: Arc<MemoryIdentityStore>,
    pub hang: AtomicBool,
    pub fail_supersede: AtomicBool,
    pub fail_deletes: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryIdentityStore>) -> Self {
        Self {
            inner,
            hang: AtomicBool::new(false),
            fail_supersede: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn set_hanging(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn set_supersede_failing(&self, fail: bool) {
        self.fail_supersede.store(fail, Ordering::SeqCst);
    }

    pub fn set_deletes_failing(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

fn injected() -> StoreError {
    StoreError::Transient(anyhow::anyhow!("injected failure"))
}

#[async_trait]
impl IdentityStore for FaultyStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.inner.health_check().await
    }

    async fn find_identity_by_id(&self, id: Uuid) -> Result<Option<Identity>, StoreError> {
        self.inner.find_identity_by_id(id).await
    }

    async fn find_identity_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Identity>, StoreError> {
        self.inner.find_identity_by_external_id(external_id).await
    }

    async fn insert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        self.inner.insert_identity(identity).await
    }

    async fn update_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        self.inner.update_identity(identity).await
    }

    async fn insert_api_key(&self, key: &ApiKey) -> Result<(), StoreError> {
        self.inner.insert_api_key(key).await
    }

    async fn find_identity_by_api_key(
        &self,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Identity>, StoreError> {
        self.inner.find_identity_by_api_key(key_hash, now).await
    }

    async fn insert_refresh_token(&self, token: NewRefreshToken) -> Result<RefreshToken, StoreError> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.insert_refresh_token(token).await
    }

    async fn find_refresh_token_with_owner(
        &self,
        token_hash: &str,
    ) -> Result<Option<(RefreshToken, Identity)>, StoreError> {
        self.inner.find_refresh_token_with_owner(token_hash).await
    }

    async fn find_refresh_token_by_id(&self, id: Uuid) -> Result<Option<RefreshToken>, StoreError> {
        self.inner.find_refresh_token_by_id(id).await
    }

    async fn soft_expire_refresh_token(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Option<RefreshToken>, StoreError> {
        self.inner.soft_expire_refresh_token(id, now, not_after).await
    }

    async fn supersede_lineage(
        &self,
        lineage_id: Uuid,
        now: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if self.fail_supersede.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.supersede_lineage(lineage_id, now, not_after).await
    }

    async fn revoke_lineage(&self, lineage_id: Uuid) -> Result<u64, StoreError> {
        self.inner.revoke_lineage(lineage_id).await
    }

    async fn list_refresh_tokens(
        &self,
        filter: &Filter,
        live_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<RefreshToken>, StoreError> {
        self.inner.list_refresh_tokens(filter, live_at).await
    }

    async fn delete_refresh_token_by_hash(&self, token_hash: &str) -> Result<bool, StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.delete_refresh_token_by_hash(token_hash).await
    }

    async fn delete_terminal_refresh_tokens(
        &self,
        now: DateTime<Utc>,
        owners: Option<&[Uuid]>,
    ) -> Result<u64, StoreError> {
        self.inner.delete_terminal_refresh_tokens(now, owners).await
    }
}
