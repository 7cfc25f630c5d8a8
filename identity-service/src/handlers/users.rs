use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use super::ValidatedJson;
use crate::middleware::Caller;
use crate::models::{Role, SanitizedIdentity};
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct ChangeRoleRequest {
    pub role: Role,
}

pub async fn change_role(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(user_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<ChangeRoleRequest>,
) -> Result<Json<SanitizedIdentity>, AppError> {
    let updated = state.identity.change_role(&ctx, user_id, req.role).await?;
    Ok(Json(updated.sanitized()))
}
