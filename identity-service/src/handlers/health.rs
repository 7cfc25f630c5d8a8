use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use service_core::error::AppError;

use crate::store::with_deadline;
use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    with_deadline(state.store_timeout(), state.store.health_check()).await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": state.config.service_name,
            "version": state.config.service_version,
        })),
    ))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
