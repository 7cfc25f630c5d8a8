//! identity-service: sessions, refresh-token rotation and per-entity
//! authorization for the community platform.

pub mod authz;
pub mod config;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;

use axum::{
    http::{header, HeaderName, HeaderValue, Method, Request},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, patch, post},
    Router,
};
use service_core::middleware::{
    metrics::metrics_middleware, security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use service_core::observability::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::authz::AuthorizationEngine;
use crate::config::IdentityConfig;
use crate::middleware::{
    session_middleware, SessionCookies, ACCESS_TOKEN_REFRESHED_HEADER, REFRESH_TOKEN_DELETED_HEADER,
};
use crate::services::{Clock, IdentityService, RotationCoordinator, TokenIssuer};
use crate::store::IdentityStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<IdentityConfig>,
    pub store: Arc<dyn IdentityStore>,
    pub issuer: Arc<TokenIssuer>,
    pub rotation: Arc<RotationCoordinator>,
    pub identity: Arc<IdentityService>,
    pub engine: Arc<AuthorizationEngine>,
    pub cookies: Arc<SessionCookies>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wire every service against one store and one clock.
    pub fn new(
        config: IdentityConfig,
        store: Arc<dyn IdentityStore>,
        clock: Arc<dyn Clock>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let store_timeout = config.session.store_timeout();

        let issuer = Arc::new(TokenIssuer::new(
            &config.jwt,
            store.clone(),
            clock.clone(),
            store_timeout,
        ));
        let rotation = Arc::new(RotationCoordinator::new(
            store.clone(),
            issuer.clone(),
            clock.clone(),
            config.session.rotation_grace(),
            store_timeout,
        ));
        let engine = Arc::new(AuthorizationEngine::standard());
        let identity = Arc::new(IdentityService::new(
            store.clone(),
            issuer.clone(),
            engine.clone(),
            clock.clone(),
            store_timeout,
        ));
        let cookies = Arc::new(SessionCookies::from_config(&config));

        Self {
            config: Arc::new(config),
            store,
            issuer,
            rotation,
            identity,
            engine,
            cookies,
            clock,
            metrics,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        self.config.session.store_timeout()
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.security.allowed_origins, &state.config.security.api_key_header);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .route("/auth/me", get(handlers::auth::me))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/sessions", get(handlers::sessions::list_sessions))
        .route(
            "/auth/sessions/:session_id",
            delete(handlers::sessions::revoke_session),
        )
        .route("/auth/api-keys", post(handlers::api_keys::create_api_key))
        .route("/users/:user_id/role", patch(handlers::users::change_role))
        .layer(from_fn_with_state(state.clone(), session_middleware))
        .with_state(state)
        .layer(from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors)
}

fn cors_layer(allowed_origins: &[String], api_key_header: &str) -> CorsLayer {
    let mut headers = vec![header::AUTHORIZATION, header::CONTENT_TYPE];
    match HeaderName::try_from(api_key_header) {
        Ok(name) => headers.push(name),
        Err(e) => tracing::error!(header = %api_key_header, error = %e, "Invalid API key header name"),
    }

    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(headers)
        .expose_headers([
            HeaderName::from_static(ACCESS_TOKEN_REFRESHED_HEADER),
            HeaderName::from_static(REFRESH_TOKEN_DELETED_HEADER),
        ]);

    // Credentialed CORS cannot be combined with a wildcard origin.
    if allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(origin = %o, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    layer.allow_origin(origins).allow_credentials(true)
}
