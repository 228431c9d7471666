//! Environment listing endpoint

use crate::AppState;
use actix_web::{get, web, HttpResponse};
use tee_common::TeeError;

#[get("/environments")]
pub async fn list_environments(state: web::Data<AppState>) -> Result<HttpResponse, TeeError> {
    let envs = state.orchestrator.list().await?;
    tracing::info!(count = envs.len(), "environments listed");
    Ok(HttpResponse::Ok().json(envs))
}
