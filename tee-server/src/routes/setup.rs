//! Environment setup endpoint

use crate::AppState;
use actix_web::{post, web, HttpResponse};
use tee_common::{SetupRequest, TeeError};

#[post("/environments/setup")]
pub async fn setup_environment(
    state: web::Data<AppState>,
    body: web::Json<SetupRequest>,
) -> Result<HttpResponse, TeeError> {
    let req = body.into_inner();

    let dep_count = req.dependencies.as_ref().map_or(0, |d| d.count());
    tracing::info!(
        main_module = %req.main_module,
        module_count = req.modules.len(),
        dependency_count = dep_count,
        ttl_seconds = req.ttl_seconds.unwrap_or(0),
        "setup request received"
    );

    let env = state.orchestrator.setup(req).await?;

    tracing::info!(
        environment_id = %env.id,
        volume_name = %env.volume_name,
        status = %env.status,
        "environment created"
    );
    Ok(HttpResponse::Ok().json(env))
}

#[cfg(test)]
mod tests {
    use crate::routes::{self, testing};
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use std::sync::Arc;
    use tee_sandbox::runtime::{MockRuntime, MockWorker};
    use tee_sandbox::store::MemoryStore;

    #[actix_web::test]
    async fn setup_returns_ready_environment() {
        let runtime = Arc::new(MockRuntime::new());
        let store = Arc::new(MemoryStore::new());
        let app = test::init_service(
            App::new()
                .app_data(testing::state_with(runtime.clone(), store))
                .configure(routes::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/environments/setup")
            .set_json(serde_json::json!({
                "mainModule": "main.ts",
                "modules": {
                    "main.ts": "export async function handler(e, c) { return {ok: true}; }"
                },
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "ready");
        assert_eq!(body["mainModule"], "main.ts");
        assert_eq!(body["ttlSeconds"], 3600);
        let volume = body["volumeName"].as_str().unwrap();
        assert!(volume.starts_with("tee-env-"));
        assert!(runtime.volume_exists(volume));
    }

    #[actix_web::test]
    async fn setup_rejects_main_module_missing_from_modules() {
        let app = test::init_service(
            App::new()
                .app_data(testing::state_with(
                    Arc::new(MockRuntime::new()),
                    Arc::new(MemoryStore::new()),
                ))
                .configure(routes::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/environments/setup")
            .set_json(serde_json::json!({
                "mainModule": "main.ts",
                "modules": { "other.ts": "export {}" },
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["code"], "validation_error");
    }

    #[actix_web::test]
    async fn setup_rejects_empty_modules() {
        let app = test::init_service(
            App::new()
                .app_data(testing::state_with(
                    Arc::new(MockRuntime::new()),
                    Arc::new(MemoryStore::new()),
                ))
                .configure(routes::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/environments/setup")
            .set_json(serde_json::json!({
                "mainModule": "main.ts",
                "modules": {},
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn worker_failure_surfaces_as_setup_failed() {
        let runtime = Arc::new(MockRuntime::scripted(|_| {
            Ok(MockWorker::failure(1, "disk full"))
        }));
        let app = test::init_service(
            App::new()
                .app_data(testing::state_with(runtime, Arc::new(MemoryStore::new())))
                .configure(routes::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/environments/setup")
            .set_json(serde_json::json!({
                "mainModule": "main.ts",
                "modules": { "main.ts": "export {}" },
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["code"], "setup_failed");
    }
}
