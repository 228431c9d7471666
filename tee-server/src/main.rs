//! TEE API Server - Trusted Execution Environment
//!
//! HTTP front for the execution core: wires the Docker runtime and the
//! Postgres store into the orchestrator, reconciles state at boot, starts
//! the background reaper, and serves the environments API.

mod config;
mod middleware;
mod routes;

use actix_web::{web, App, HttpServer};
use config::Config;
use std::sync::Arc;
use std::time::Duration;
use tee_sandbox::runtime::{ContainerRuntime, DockerRuntime, Isolation};
use tee_sandbox::store::{PgStore, Store};
use tee_sandbox::{Orchestrator, Reaper};
use tracing::{info, warn};

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&config.log_level);

    println!("{}", "=".repeat(80));
    println!("  TEE API Server - Trusted Execution Environment");
    println!("{}", "=".repeat(80));

    match config.isolation {
        Isolation::Hard => {
            info!("gVisor sandboxing enabled - all executions run in kernel-sandboxed containers")
        }
        Isolation::Relaxed => warn!(
            "SECURITY WARNING: gVisor is DISABLED - code execution is not kernel-sandboxed. \
             Use only for local development; do not run in production"
        ),
    }
    if config.auth_disabled {
        warn!(security = "degraded", "bearer token authentication is DISABLED");
    }

    info!(
        host = %config.database.host,
        database = %config.database.name,
        "connecting to database"
    );
    let store = PgStore::connect(&config.database.url())
        .await
        .expect("failed to connect to database");
    store
        .init_schema()
        .await
        .expect("failed to initialize database schema");

    let store: Arc<dyn Store> = Arc::new(store);
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(config.isolation));
    let orchestrator = Arc::new(Orchestrator::new(
        runtime.clone(),
        store.clone(),
        config.core.clone(),
    ));

    let reaper = Arc::new(Reaper::new(
        store,
        runtime,
        Duration::from_secs(config.reaper_interval_secs),
    ));
    if let Err(e) = reaper.reconcile().await {
        warn!(error = %e, "environment reconciliation failed");
    }
    reaper.spawn();

    info!(port = config.port, "TEE API server listening");

    let bearer_token = config.bearer_token.clone();
    let auth_disabled = config.auth_disabled;
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(AppState {
                orchestrator: orchestrator.clone(),
            }))
            .wrap(middleware::BearerAuth::new(
                bearer_token.clone(),
                auth_disabled,
            ))
            .wrap(middleware::Recovery)
            .wrap(middleware::RequestLogging)
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", config.port))?
    .run()
    .await
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
