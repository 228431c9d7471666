//! Handler execution endpoint
//!
//! A non-zero exit code is still HTTP 200; the protocol only fails when the
//! engine itself cannot run the worker.

use crate::AppState;
use actix_web::error::JsonPayloadError;
use actix_web::{web, HttpRequest, HttpResponse};
use tee_common::{ExecuteRequest, TeeError};
use uuid::Uuid;

pub async fn execute_in_environment(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ExecuteRequest>,
) -> Result<HttpResponse, TeeError> {
    let env_id = Uuid::parse_str(&path.into_inner())
        .map_err(|_| TeeError::Validation("Invalid environment ID".to_string()))?;
    let req = body.into_inner();

    tracing::info!(environment_id = %env_id, "execute request received");

    let resp = state.orchestrator.execute(env_id, req).await?;

    tracing::info!(
        environment_id = %env_id,
        execution_id = %resp.id,
        exit_code = resp.exit_code,
        duration_ms = resp.duration_ms,
        "execution result"
    );
    Ok(HttpResponse::Ok().json(resp))
}

/// Maps an oversized execute body to 413 instead of the default 400.
pub(super) fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    match err {
        JsonPayloadError::Overflow { .. } | JsonPayloadError::OverflowKnownLength { .. } => {
            TeeError::RequestTooLarge.into()
        }
        other => TeeError::Validation(other.to_string()).into(),
    }
}
