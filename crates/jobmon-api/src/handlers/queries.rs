// Read-only observability routes. Each handler is a single read
// transaction in the storage layer; nothing here mutates state.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use jobmon_core::stats::{parse_confidence, ResourceUsageStats};
use jobmon_core::JobmonError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiResult;
use crate::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflow/:workflow_id/overview", get(workflow_overview))
        .route(
            "/workflow/:workflow_id/task_template_status_counts",
            get(task_template_status_counts),
        )
        .route("/workflow/:workflow_id/task_table", get(task_table))
        .route("/workflow/:workflow_id/clustered_errors", get(clustered_errors))
        .route("/workflow/:workflow_id/task_template_dag", get(task_template_dag))
        .route(
            "/task_template/:task_template_version_id/resource_usage",
            get(resource_usage),
        )
        .route(
            "/task_instance/:id/task_instance_error_log",
            get(task_instance_error_log),
        )
        .route("/task/:task_id", get(get_task))
        .route("/task/:task_id/status_audit", get(task_status_audit))
        .with_state(state)
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkflowOverviewResponse {
    pub workflow_id: i64,
    pub name: Option<String>,
    pub status: String,
    pub user_name: String,
    pub max_concurrently_running: i32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub task_status_counts: Vec<StatusCount>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

/// GET /workflow/:workflow_id/overview
#[utoipa::path(
    get,
    path = "/api/v3/workflow/{workflow_id}/overview",
    params(("workflow_id" = i64, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Workflow overview", body = WorkflowOverviewResponse),
        (status = 404, description = "Workflow not found")
    ),
    tag = "queries"
)]
pub async fn workflow_overview(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> ApiResult<Json<WorkflowOverviewResponse>> {
    let overview = state
        .db
        .workflow_overview(workflow_id)
        .await?
        .ok_or_else(|| JobmonError::not_found(format!("workflow {} does not exist", workflow_id)))?;

    Ok(Json(WorkflowOverviewResponse {
        workflow_id: overview.workflow.id,
        name: overview.workflow.name,
        status: overview.workflow.status,
        user_name: overview.workflow.user_name,
        max_concurrently_running: overview.workflow.max_concurrently_running,
        created_at: overview.workflow.created_at,
        task_status_counts: overview
            .task_status_counts
            .into_iter()
            .map(|r| StatusCount {
                status: r.status,
                count: r.count,
            })
            .collect(),
    }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TemplateStatusCount {
    pub task_template_name: String,
    pub status: String,
    pub count: i64,
}

/// GET /workflow/:workflow_id/task_template_status_counts
#[utoipa::path(
    get,
    path = "/api/v3/workflow/{workflow_id}/task_template_status_counts",
    params(("workflow_id" = i64, Path, description = "Workflow ID")),
    responses((status = 200, description = "Counts per template", body = Vec<TemplateStatusCount>)),
    tag = "queries"
)]
pub async fn task_template_status_counts(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> ApiResult<Json<Vec<TemplateStatusCount>>> {
    let rows = state.db.task_template_status_counts(workflow_id).await?;
    Ok(Json(
        rows.into_iter()
            .map(|r| TemplateStatusCount {
                task_template_name: r.task_template_name,
                status: r.status,
                count: r.count,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TaskTableParams {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskTableRow {
    pub task_id: i64,
    pub name: String,
    pub status: String,
    pub status_date: chrono::DateTime<chrono::Utc>,
    pub num_attempts: i32,
    pub max_attempts: i32,
    pub array_name: String,
}

/// GET /workflow/:workflow_id/task_table
#[utoipa::path(
    get,
    path = "/api/v3/workflow/{workflow_id}/task_table",
    params(
        ("workflow_id" = i64, Path, description = "Workflow ID"),
        ("status" = Option<String>, Query, description = "Filter by status code"),
        ("limit" = Option<i64>, Query, description = "Page size (default 100)"),
        ("offset" = Option<i64>, Query, description = "Page offset")
    ),
    responses((status = 200, description = "Task table page", body = Vec<TaskTableRow>)),
    tag = "queries"
)]
pub async fn task_table(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
    Query(params): Query<TaskTableParams>,
) -> ApiResult<Json<Vec<TaskTableRow>>> {
    let rows = state
        .db
        .task_table(
            workflow_id,
            params.status.as_deref(),
            params.limit,
            params.offset,
        )
        .await?;
    Ok(Json(
        rows.into_iter()
            .map(|r| TaskTableRow {
                task_id: r.id,
                name: r.name,
                status: r.status,
                status_date: r.status_date,
                num_attempts: r.num_attempts,
                max_attempts: r.max_attempts,
                array_name: r.array_name,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ClusteredErrorsParams {
    #[serde(default = "default_error_limit")]
    pub limit: i64,
}

fn default_error_limit() -> i64 {
    20
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClusteredError {
    pub description: String,
    pub occurrences: i64,
    pub first_seen: chrono::DateTime<chrono::Utc>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    pub sample_task_instance_id: i64,
}

/// GET /workflow/:workflow_id/clustered_errors
#[utoipa::path(
    get,
    path = "/api/v3/workflow/{workflow_id}/clustered_errors",
    params(
        ("workflow_id" = i64, Path, description = "Workflow ID"),
        ("limit" = Option<i64>, Query, description = "Max clusters (default 20)")
    ),
    responses((status = 200, description = "Errors grouped by message", body = Vec<ClusteredError>)),
    tag = "queries"
)]
pub async fn clustered_errors(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
    Query(params): Query<ClusteredErrorsParams>,
) -> ApiResult<Json<Vec<ClusteredError>>> {
    let rows = state.db.clustered_errors(workflow_id, params.limit).await?;
    Ok(Json(
        rows.into_iter()
            .map(|r| ClusteredError {
                description: r.description,
                occurrences: r.occurrences,
                first_seen: r.first_seen,
                last_seen: r.last_seen,
                sample_task_instance_id: r.sample_task_instance_id,
            })
            .collect(),
    ))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TemplateDagEdge {
    pub name: String,
    pub downstream_task_template_id: i64,
}

/// GET /workflow/:workflow_id/task_template_dag
#[utoipa::path(
    get,
    path = "/api/v3/workflow/{workflow_id}/task_template_dag",
    params(("workflow_id" = i64, Path, description = "Workflow ID")),
    responses((status = 200, description = "Template-level DAG", body = Vec<TemplateDagEdge>)),
    tag = "queries"
)]
pub async fn task_template_dag(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> ApiResult<Json<Vec<TemplateDagEdge>>> {
    let rows = state.db.task_template_dag(workflow_id).await?;
    Ok(Json(
        rows.into_iter()
            .map(|r| TemplateDagEdge {
                name: r.name,
                downstream_task_template_id: r.downstream_task_template_id,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResourceUsageParams {
    /// Confidence level as a string, e.g. "0.95"
    pub confidence: Option<String>,
}

/// GET /task_template/:task_template_version_id/resource_usage
#[utoipa::path(
    get,
    path = "/api/v3/task_template/{task_template_version_id}/resource_usage",
    params(
        ("task_template_version_id" = i64, Path, description = "Template version ID"),
        ("confidence" = Option<String>, Query, description = "Confidence level (default 0.95)")
    ),
    responses((status = 200, description = "Usage statistics", body = ResourceUsageStats)),
    tag = "queries"
)]
pub async fn resource_usage(
    State(state): State<AppState>,
    Path(task_template_version_id): Path<i64>,
    Query(params): Query<ResourceUsageParams>,
) -> ApiResult<Json<ResourceUsageStats>> {
    let confidence = parse_confidence(params.confidence.as_deref().unwrap_or("0.95"));
    let samples = state
        .db
        .resource_usage_samples(task_template_version_id)
        .await?;

    let mem: Vec<f64> = samples
        .iter()
        .filter_map(|s| s.maxrss_bytes)
        .map(|b| b as f64)
        .collect();
    let runtime: Vec<f64> = samples.iter().filter_map(|s| s.wallclock_seconds).collect();

    Ok(Json(ResourceUsageStats::from_samples(&mem, &runtime, confidence)))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorLogEntry {
    pub id: i64,
    pub description: String,
    pub error_time: chrono::DateTime<chrono::Utc>,
}

/// GET /task_instance/:id/task_instance_error_log
#[utoipa::path(
    get,
    path = "/api/v3/task_instance/{id}/task_instance_error_log",
    params(("id" = i64, Path, description = "Task instance ID")),
    responses((status = 200, description = "Error log entries", body = Vec<ErrorLogEntry>)),
    tag = "queries"
)]
pub async fn task_instance_error_log(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<ErrorLogEntry>>> {
    let rows = state.db.get_task_instance_error_logs(id).await?;
    Ok(Json(
        rows.into_iter()
            .map(|r| ErrorLogEntry {
                id: r.id,
                description: r.description,
                error_time: r.error_time,
            })
            .collect(),
    ))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskResponse {
    pub id: i64,
    pub workflow_id: i64,
    pub name: String,
    pub status: String,
    pub num_attempts: i32,
    pub max_attempts: i32,
}

/// GET /task/:task_id
#[utoipa::path(
    get,
    path = "/api/v3/task/{task_id}",
    params(("task_id" = i64, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task", body = TaskResponse),
        (status = 404, description = "Task not found")
    ),
    tag = "queries"
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Json<TaskResponse>> {
    let row = state
        .db
        .get_task(task_id)
        .await?
        .ok_or_else(|| JobmonError::not_found(format!("task {} does not exist", task_id)))?;
    Ok(Json(TaskResponse {
        id: row.id,
        workflow_id: row.workflow_id,
        name: row.name,
        status: row.status,
        num_attempts: row.num_attempts,
        max_attempts: row.max_attempts,
    }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuditEntryResponse {
    pub previous_status: String,
    pub new_status: String,
    pub status_date: chrono::DateTime<chrono::Utc>,
}

/// GET /task/:task_id/status_audit - full transition history, oldest first
#[utoipa::path(
    get,
    path = "/api/v3/task/{task_id}/status_audit",
    params(("task_id" = i64, Path, description = "Task ID")),
    responses((status = 200, description = "Audit trail", body = Vec<AuditEntryResponse>)),
    tag = "queries"
)]
pub async fn task_status_audit(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Json<Vec<AuditEntryResponse>>> {
    let rows = state.db.get_task_audit(task_id).await?;
    Ok(Json(
        rows.into_iter()
            .map(|r| AuditEntryResponse {
                previous_status: r.previous_status,
                new_status: r.new_status,
                status_date: r.status_date,
            })
            .collect(),
    ))
}
