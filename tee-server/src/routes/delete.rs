//! Environment deletion endpoint

use crate::AppState;
use actix_web::{delete, web, HttpResponse};
use tee_common::TeeError;
use uuid::Uuid;

#[delete("/environments/{id}")]
pub async fn delete_environment(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, TeeError> {
    let env_id = Uuid::parse_str(&path.into_inner())
        .map_err(|_| TeeError::Validation("Invalid environment ID".to_string()))?;

    tracing::info!(environment_id = %env_id, "delete request received");
    state.orchestrator.delete(env_id).await?;

    Ok(HttpResponse::NoContent().finish())
}
