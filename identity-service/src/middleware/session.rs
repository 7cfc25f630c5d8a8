//! Per-request identity resolution.
//!
//! Credentials are tried in a fixed order: machine API key, bearer access
//! token, then the refresh-token cookie. Failure to resolve never rejects the
//! request; handlers decide whether they need an identity.

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;
use std::net::SocketAddr;

use crate::authz::RequestContext;
use crate::models::Identity;
use crate::services::{ClientInfo, RotationError, TokenError, TokenPair};
use crate::AppState;

pub const ACCESS_TOKEN_REFRESHED_HEADER: &str = "x-access-token-refreshed";
pub const REFRESH_TOKEN_DELETED_HEADER: &str = "x-refresh-token-deleted";

/// What to do with the session cookies once the handler has run.
enum CookieAction {
    Keep,
    Refreshed(Box<TokenPair>),
    Clear,
}

struct Resolution {
    ctx: RequestContext,
    source: &'static str,
    cookies: CookieAction,
}

impl Resolution {
    fn anonymous(source: &'static str) -> Self {
        Self {
            ctx: RequestContext::anonymous(),
            source,
            cookies: CookieAction::Keep,
        }
    }

    fn authenticated(identity: Identity, source: &'static str) -> Self {
        Self {
            ctx: RequestContext::authenticated(identity),
            source,
            cookies: CookieAction::Keep,
        }
    }
}

pub async fn session_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let jar = CookieJar::from_headers(req.headers());
    let client = client_info(&req, state.config.security.trust_forwarded_for);

    let resolution = resolve(&state, req.headers(), &jar, &client).await;
    metrics::counter!("session_resolutions_total", "source" => resolution.source).increment(1);
    tracing::debug!(
        source = resolution.source,
        identity_id = ?resolution.ctx.identity().map(|i| i.id),
        "Session resolved"
    );

    req.extensions_mut().insert(resolution.ctx);
    let mut response = next.run(req).await;

    // A handler that signed the session out wins over a rotation done here.
    let signed_out = response.headers().contains_key(REFRESH_TOKEN_DELETED_HEADER);

    match resolution.cookies {
        CookieAction::Keep => response,
        CookieAction::Refreshed(pair) if signed_out => {
            if let Err(e) = state.identity.sign_out(&pair.refresh_token).await {
                tracing::warn!(error = %e, "Failed to discard rotated token after sign-out");
            }
            response
        }
        CookieAction::Refreshed(pair) => {
            response.headers_mut().insert(
                HeaderName::from_static(ACCESS_TOKEN_REFRESHED_HEADER),
                HeaderValue::from_static("true"),
            );
            (state.cookies.set_pair(jar, &pair), response).into_response()
        }
        CookieAction::Clear => {
            response.headers_mut().insert(
                HeaderName::from_static(REFRESH_TOKEN_DELETED_HEADER),
                HeaderValue::from_static("true"),
            );
            (state.cookies.clear(jar), response).into_response()
        }
    }
}

async fn resolve(state: &AppState, headers: &HeaderMap, jar: &CookieJar, client: &ClientInfo) -> Resolution {
    let api_key = headers
        .get(state.config.security.api_key_header.as_str())
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    if let Some(raw_key) = api_key {
        return match state.identity.resolve_api_key(raw_key).await {
            Ok(Some(identity)) => Resolution::authenticated(identity, "api_key"),
            Ok(None) => Resolution::anonymous("invalid_api_key"),
            Err(e) => {
                tracing::error!(error = %e, "API key lookup failed");
                Resolution::anonymous("error")
            }
        };
    }

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let mut bearer_expired = false;
    if let Some(token) = bearer {
        match state.issuer.parse_access_token(token) {
            Ok(claims) => {
                return match state
                    .identity
                    .find_by_external_id(&RequestContext::anonymous(), &claims.sub)
                    .await
                {
                    Ok(Some(identity)) => Resolution::authenticated(identity, "bearer"),
                    Ok(None) => Resolution::anonymous("unknown_subject"),
                    Err(e) => {
                        tracing::error!(error = %e, "Identity lookup failed");
                        Resolution::anonymous("error")
                    }
                };
            }
            Err(TokenError::Expired) => bearer_expired = true,
            Err(e) => {
                tracing::debug!(error = %e, "Rejected bearer token");
                return Resolution::anonymous("invalid_bearer");
            }
        }
    }

    let Some(raw_refresh) = state.cookies.refresh_token(jar) else {
        if bearer_expired {
            return Resolution {
                cookies: CookieAction::Clear,
                ..Resolution::anonymous("expired_bearer")
            };
        }
        return Resolution::anonymous("anonymous");
    };

    match state.rotation.rotate(raw_refresh, client).await {
        Ok(rotated) => Resolution {
            ctx: RequestContext::authenticated(rotated.identity),
            source: "refresh",
            cookies: CookieAction::Refreshed(Box::new(rotated.pair)),
        },
        Err(RotationError::Superseded) => {
            // A straggler carrying an already-rotated cookie. The client holds
            // the successor, so leave its cookies alone.
            tracing::debug!("Superseded refresh token presented");
            Resolution::anonymous("superseded_refresh")
        }
        Err(e) if e.ends_session() => {
            tracing::info!(outcome = e.outcome(), "Refresh token rejected; clearing session");
            if let Err(e) = state.identity.sign_out(raw_refresh).await {
                tracing::warn!(error = %e, "Failed to delete rejected refresh token");
            }
            Resolution {
                cookies: CookieAction::Clear,
                ..Resolution::anonymous("rejected_refresh")
            }
        }
        Err(e) => {
            tracing::error!(error = %e, outcome = e.outcome(), "Refresh token rotation failed");
            Resolution::anonymous("error")
        }
    }
}

fn client_info(req: &Request, trust_forwarded_for: bool) -> ClientInfo {
    let headers = req.headers();
    let forwarded = headers
        .get("x-forwarded-for")
        .filter(|_| trust_forwarded_for)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let ip_address = forwarded.or_else(|| {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    });
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ClientInfo {
        ip_address,
        user_agent,
    }
}

/// Request context resolved by `session_middleware`; anonymous when absent.
pub struct Caller(pub RequestContext);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Caller(
            parts
                .extensions
                .get::<RequestContext>()
                .cloned()
                .unwrap_or_default(),
        ))
    }
}

/// Caller that must carry an identity; rejects with 401 otherwise.
pub struct AuthenticatedCaller {
    pub identity: Identity,
    pub ctx: RequestContext,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthenticatedCaller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Caller(ctx) = Caller::from_request_parts(parts, state).await?;
        let identity = ctx
            .identity()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Authentication required")))?;
        Ok(Self { identity, ctx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request() -> Request {
        let mut req = Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .header(header::USER_AGENT, "curl/8.0")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 2], 4000))));
        req
    }

    #[test]
    fn test_forwarded_for_used_only_when_trusted() {
        let trusted = client_info(&request(), true);
        assert_eq!(trusted.ip_address.as_deref(), Some("203.0.113.9"));
        assert_eq!(trusted.user_agent.as_deref(), Some("curl/8.0"));

        let direct = client_info(&request(), false);
        assert_eq!(direct.ip_address.as_deref(), Some("10.0.0.2"));
    }
}
