use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use super::ValidatedJson;
use crate::middleware::Caller;
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateApiKeyRequest {
    #[validate(range(min = 1, max = 365, message = "expires_in_days must be between 1 and 365"))]
    pub expires_in_days: i64,
}

#[derive(Debug, Serialize)]
pub struct CreateApiKeyResponse {
    pub id: Uuid,
    /// Shown once; only its hash is stored.
    pub api_key: String,
    pub expires_on: DateTime<Utc>,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    ValidatedJson(req): ValidatedJson<CreateApiKeyRequest>,
) -> Result<(StatusCode, Json<CreateApiKeyResponse>), AppError> {
    let created = state.identity.create_api_key(&ctx, req.expires_in_days).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateApiKeyResponse {
            id: created.key.id,
            api_key: created.raw_key,
            expires_on: created.key.expires_on,
        }),
    ))
}
