use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::middleware::Caller;
use crate::models::SessionInfo;
use crate::AppState;

/// Live sessions visible to the caller. Admins see every session.
pub async fn list_sessions(
    State(state): State<AppState>,
    Caller(ctx): Caller,
) -> Result<Json<Vec<SessionInfo>>, AppError> {
    let tokens = state.identity.list_sessions(&ctx).await?;
    Ok(Json(tokens.into_iter().map(SessionInfo::from).collect()))
}

pub async fn revoke_session(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.identity.revoke_session(&ctx, session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
