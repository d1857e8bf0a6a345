// Jobmon coordination API server
// Decision: every configured API version mounts the same authoritative
//           route set; the distributor targets v3

mod auth;
mod error;
mod handlers;
mod reaper;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use jobmon_core::JobmonConfig;
use jobmon_storage::Database;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::reaper::Reaper;

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<JobmonConfig>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    api_versions: Vec<String>,
}

async fn health(
    axum::extract::State(versions): axum::extract::State<Vec<String>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        api_versions: versions,
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::bind::create_tool,
        handlers::bind::create_tool_version,
        handlers::bind::create_task_template,
        handlers::bind::create_task_template_version,
        handlers::bind::bind_nodes,
        handlers::bind::bind_dag,
        handlers::bind::bind_workflow,
        handlers::bind::create_workflow_run,
        handlers::bind::create_array,
        handlers::bind::bind_tasks,
        handlers::bind::create_task_resources,
        handlers::workflow::update_max_concurrently_running,
        handlers::workflow::update_array_max_concurrently_running,
        handlers::workflow::get_max_concurrently_running,
        handlers::workflow::set_resume_state,
        handlers::workflow::stop_workflow,
        handlers::workflow::get_workflow_run,
        handlers::workflow::log_heartbeat,
        handlers::workflow::update_run_status,
        handlers::workflow::queued_task_instances,
        handlers::workflow::kill_batches,
        handlers::workflow::adjusting_tasks,
        handlers::array::queue_task_batch,
        handlers::array::transition_to_launched,
        handlers::array::transition_to_killed,
        handlers::task_instance::instantiate_task_instances,
        handlers::task_instance::log_distributor_id,
        handlers::task_instance::log_no_distributor_id,
        handlers::task_instance::log_running,
        handlers::task_instance::log_instance_heartbeat,
        handlers::task_instance::log_done,
        handlers::task_instance::log_known_error,
        handlers::task_instance::log_unknown_error,
        handlers::task_instance::log_error_worker_node,
        handlers::task_instance::log_resource_error,
        handlers::queries::workflow_overview,
        handlers::queries::task_template_status_counts,
        handlers::queries::task_table,
        handlers::queries::clustered_errors,
        handlers::queries::task_template_dag,
        handlers::queries::resource_usage,
        handlers::queries::task_instance_error_log,
        handlers::queries::get_task,
        handlers::queries::task_status_audit,
        handlers::admin::update_task_statuses,
    ),
    tags(
        (name = "bind", description = "Entity binding endpoints"),
        (name = "workflow", description = "Workflow control endpoints"),
        (name = "workflow_run", description = "Workflow run endpoints"),
        (name = "array", description = "Array batch transitions"),
        (name = "task_instance", description = "Task instance lifecycle"),
        (name = "queries", description = "Read-only observability"),
        (name = "admin", description = "Administrative overrides")
    ),
    info(
        title = "Jobmon API",
        description = "Coordination API for distributed workflow orchestration",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobmon_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("jobmon-api starting...");

    let config_path = std::env::var("JOBMON_CONFIG_FILE").ok();
    let config = JobmonConfig::load(config_path.as_deref().map(std::path::Path::new))
        .context("Failed to load configuration")?;
    let config = Arc::new(config);

    // Initialize database
    let db = Database::from_config(&config.db)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;
    tracing::info!("Connected to database");

    // Reaper runs in-process; the database lease keeps it singleton across
    // replicas.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    if config.reaper.enabled {
        Reaper::new(db.clone(), config.reaper.clone()).spawn(shutdown_rx.clone());
    } else {
        tracing::warn!("Reaper disabled by configuration");
    }

    let state = AppState {
        db,
        config: config.clone(),
    };

    // The same route set mounts under every configured version.
    let auth_config = Arc::new(config.auth.clone());
    let api = handlers::api_router(state).layer(axum::middleware::from_fn_with_state(
        auth_config,
        auth::identity_middleware,
    ));

    let mut app = Router::new().route(
        "/health",
        get(health).with_state(config.server.api_versions.clone()),
    );
    for version in &config.server.api_versions {
        tracing::info!(version = %version, "Mounting API version");
        app = app.nest(&format!("/api/{}", version), api.clone());
    }

    let app = app
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", config.server.bind_address);

    axum::serve(listener, app).await.context("Server error")?;

    drop(shutdown_tx);
    Ok(())
}
