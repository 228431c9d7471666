//! HTTP routes

mod delete;
mod execute;
mod health;
mod list;
mod setup;

use actix_web::web;

/// Execute bodies are capped; setup bodies carry module sources and keep the
/// framework default.
pub const MAX_EXECUTE_BODY_BYTES: usize = 1 << 20;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(setup::setup_environment)
        .service(
            web::resource("/environments/{id}/execute")
                .app_data(
                    web::JsonConfig::default()
                        .limit(MAX_EXECUTE_BODY_BYTES)
                        .error_handler(execute::json_error_handler),
                )
                .route(web::post().to(execute::execute_in_environment)),
        )
        .service(list::list_environments)
        .service(delete::delete_environment)
        .service(health::health_check);
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::AppState;
    use actix_web::web;
    use std::sync::Arc;
    use tee_sandbox::runtime::{MockRuntime, MockWorker};
    use tee_sandbox::store::MemoryStore;
    use tee_sandbox::{CoreConfig, Orchestrator};

    pub fn state_with(
        runtime: Arc<MockRuntime>,
        store: Arc<MemoryStore>,
    ) -> web::Data<AppState> {
        web::Data::new(AppState {
            orchestrator: Arc::new(Orchestrator::new(runtime, store, CoreConfig::default())),
        })
    }

    /// A runtime whose every worker prints the given stdout line and exits 0.
    pub fn runtime_printing(line: &'static str) -> Arc<MockRuntime> {
        Arc::new(MockRuntime::scripted(move |_| {
            Ok(MockWorker::with_stdout(line))
        }))
    }
}
