use axum::{
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::CookieJar;

use crate::middleware::{AuthenticatedCaller, REFRESH_TOKEN_DELETED_HEADER};
use crate::models::SanitizedIdentity;
use crate::AppState;

/// Current identity.
pub async fn me(caller: AuthenticatedCaller) -> Json<SanitizedIdentity> {
    Json(caller.identity.sanitized())
}

/// Delete the presented refresh token and clear both session cookies.
///
/// Cookies are cleared even when the store fails; the row is then left for
/// the cleanup task once it expires.
pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> Response {
    if let Some(raw) = state.cookies.refresh_token(&jar) {
        if let Err(e) = state.identity.sign_out(raw).await {
            tracing::error!(error = %e, "Failed to delete refresh token on logout");
        }
    }

    let mut response = (state.cookies.clear(jar), StatusCode::NO_CONTENT).into_response();
    response.headers_mut().insert(
        HeaderName::from_static(REFRESH_TOKEN_DELETED_HEADER),
        HeaderValue::from_static("true"),
    );
    response
}
