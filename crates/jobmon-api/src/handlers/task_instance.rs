// Task instance lifecycle routes: the log_* family used by the distributor
// and by workers on cluster nodes.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use jobmon_storage::models::TaskInstanceRow;
use jobmon_storage::UsageReport;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiResult;
use crate::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/task_instance/instantiate_task_instances",
            post(instantiate_task_instances),
        )
        .route("/task_instance/:id/log_distributor_id", post(log_distributor_id))
        .route(
            "/task_instance/:id/log_no_distributor_id",
            post(log_no_distributor_id),
        )
        .route("/task_instance/:id/log_running", post(log_running))
        .route("/task_instance/:id/log_heartbeat", post(log_instance_heartbeat))
        .route("/task_instance/:id/log_done", post(log_done))
        .route("/task_instance/:id/log_known_error", post(log_known_error))
        .route("/task_instance/:id/log_unknown_error", post(log_unknown_error))
        .route(
            "/task_instance/:id/log_error_worker_node",
            post(log_error_worker_node),
        )
        .route("/task_instance/:id/log_resource_error", post(log_resource_error))
        .with_state(state)
}

/// Wire shape of a task instance after a lifecycle call.
#[derive(Debug, Serialize, ToSchema)]
pub struct TaskInstanceResponse {
    pub id: i64,
    pub task_id: i64,
    pub workflow_run_id: i64,
    pub status: String,
    pub distributor_id: Option<String>,
    pub nodename: Option<String>,
    pub report_by_date: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<TaskInstanceRow> for TaskInstanceResponse {
    fn from(row: TaskInstanceRow) -> Self {
        TaskInstanceResponse {
            id: row.id,
            task_id: row.task_id,
            workflow_run_id: row.workflow_run_id,
            status: row.status,
            distributor_id: row.distributor_id,
            nodename: row.nodename,
            report_by_date: row.report_by_date,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct InstantiateRequest {
    pub task_instance_ids: Vec<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct InstantiateResponse {
    /// The subset of requested instances this call claimed
    pub task_instance_ids: Vec<i64>,
}

/// POST /task_instance/instantiate_task_instances
#[utoipa::path(
    post,
    path = "/api/v3/task_instance/instantiate_task_instances",
    request_body = InstantiateRequest,
    responses((status = 200, description = "Instances claimed", body = InstantiateResponse)),
    tag = "task_instance"
)]
pub async fn instantiate_task_instances(
    State(state): State<AppState>,
    Json(req): Json<InstantiateRequest>,
) -> ApiResult<Json<InstantiateResponse>> {
    let claimed = state
        .db
        .instantiate_task_instances(&req.task_instance_ids)
        .await?;
    Ok(Json(InstantiateResponse {
        task_instance_ids: claimed,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogDistributorIdRequest {
    pub distributor_id: String,
    pub next_report_increment: i64,
}

/// POST /task_instance/:id/log_distributor_id
#[utoipa::path(
    post,
    path = "/api/v3/task_instance/{id}/log_distributor_id",
    params(("id" = i64, Path, description = "Task instance ID")),
    request_body = LogDistributorIdRequest,
    responses((status = 200, description = "Recorded", body = TaskInstanceResponse)),
    tag = "task_instance"
)]
pub async fn log_distributor_id(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<LogDistributorIdRequest>,
) -> ApiResult<Json<TaskInstanceResponse>> {
    let row = state
        .db
        .log_distributor_id(id, &req.distributor_id, req.next_report_increment)
        .await?;
    Ok(Json(row.into()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogNoDistributorIdRequest {
    #[serde(default = "default_no_distributor_description")]
    pub description: String,
}

fn default_no_distributor_description() -> String {
    "cluster submission returned no distributor id".to_string()
}

/// POST /task_instance/:id/log_no_distributor_id
#[utoipa::path(
    post,
    path = "/api/v3/task_instance/{id}/log_no_distributor_id",
    params(("id" = i64, Path, description = "Task instance ID")),
    request_body = LogNoDistributorIdRequest,
    responses((status = 200, description = "Recorded", body = TaskInstanceResponse)),
    tag = "task_instance"
)]
pub async fn log_no_distributor_id(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<LogNoDistributorIdRequest>,
) -> ApiResult<Json<TaskInstanceResponse>> {
    let row = state.db.log_no_distributor_id(id, &req.description).await?;
    Ok(Json(row.into()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogRunningRequest {
    pub nodename: String,
    pub next_report_increment: i64,
}

/// POST /task_instance/:id/log_running - worker startup
#[utoipa::path(
    post,
    path = "/api/v3/task_instance/{id}/log_running",
    params(("id" = i64, Path, description = "Task instance ID")),
    request_body = LogRunningRequest,
    responses(
        (status = 200, description = "Running", body = TaskInstanceResponse),
        (status = 409, description = "Invalid transition")
    ),
    tag = "task_instance"
)]
pub async fn log_running(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<LogRunningRequest>,
) -> ApiResult<Json<TaskInstanceResponse>> {
    let row = state
        .db
        .log_running(id, &req.nodename, req.next_report_increment)
        .await?;
    Ok(Json(row.into()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogInstanceHeartbeatRequest {
    pub next_report_increment: i64,
}

/// POST /task_instance/:id/log_heartbeat - worker heartbeat. The response
/// status lets the worker observe a pending kill request.
#[utoipa::path(
    post,
    path = "/api/v3/task_instance/{id}/log_heartbeat",
    params(("id" = i64, Path, description = "Task instance ID")),
    request_body = LogInstanceHeartbeatRequest,
    responses(
        (status = 200, description = "Deadline advanced", body = TaskInstanceResponse),
        (status = 409, description = "Instance is terminal or kill-flagged")
    ),
    tag = "task_instance"
)]
pub async fn log_instance_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<LogInstanceHeartbeatRequest>,
) -> ApiResult<Json<TaskInstanceResponse>> {
    let row = state
        .db
        .log_task_instance_heartbeat(id, req.next_report_increment)
        .await?;
    Ok(Json(row.into()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogDoneRequest {
    pub wallclock_seconds: Option<f64>,
    pub maxrss_bytes: Option<i64>,
    pub stdout_tail: Option<String>,
}

/// POST /task_instance/:id/log_done - worker success. Idempotent.
#[utoipa::path(
    post,
    path = "/api/v3/task_instance/{id}/log_done",
    params(("id" = i64, Path, description = "Task instance ID")),
    request_body = LogDoneRequest,
    responses(
        (status = 200, description = "Done", body = TaskInstanceResponse),
        (status = 409, description = "Invalid transition")
    ),
    tag = "task_instance"
)]
pub async fn log_done(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<LogDoneRequest>,
) -> ApiResult<Json<TaskInstanceResponse>> {
    let usage = UsageReport {
        wallclock_seconds: req.wallclock_seconds,
        maxrss_bytes: req.maxrss_bytes,
    };
    let row = state.db.log_done(id, usage, req.stdout_tail.as_deref()).await?;
    Ok(Json(row.into()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogErrorRequest {
    pub description: String,
    pub stderr_tail: Option<String>,
    pub wallclock_seconds: Option<f64>,
    pub maxrss_bytes: Option<i64>,
}

/// POST /task_instance/:id/log_known_error
#[utoipa::path(
    post,
    path = "/api/v3/task_instance/{id}/log_known_error",
    params(("id" = i64, Path, description = "Task instance ID")),
    request_body = LogErrorRequest,
    responses((status = 200, description = "Error recorded", body = TaskInstanceResponse)),
    tag = "task_instance"
)]
pub async fn log_known_error(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<LogErrorRequest>,
) -> ApiResult<Json<TaskInstanceResponse>> {
    let usage = UsageReport {
        wallclock_seconds: req.wallclock_seconds,
        maxrss_bytes: req.maxrss_bytes,
    };
    let row = state
        .db
        .log_known_error(id, &req.description, req.stderr_tail.as_deref(), usage)
        .await?;
    Ok(Json(row.into()))
}

/// POST /task_instance/:id/log_unknown_error
#[utoipa::path(
    post,
    path = "/api/v3/task_instance/{id}/log_unknown_error",
    params(("id" = i64, Path, description = "Task instance ID")),
    request_body = LogErrorRequest,
    responses((status = 200, description = "Error recorded", body = TaskInstanceResponse)),
    tag = "task_instance"
)]
pub async fn log_unknown_error(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<LogErrorRequest>,
) -> ApiResult<Json<TaskInstanceResponse>> {
    let usage = UsageReport {
        wallclock_seconds: req.wallclock_seconds,
        maxrss_bytes: req.maxrss_bytes,
    };
    let row = state
        .db
        .log_unknown_error(id, &req.description, req.stderr_tail.as_deref(), usage)
        .await?;
    Ok(Json(row.into()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogWorkerNodeErrorRequest {
    pub description: String,
    pub stderr_tail: Option<String>,
}

/// POST /task_instance/:id/log_error_worker_node
#[utoipa::path(
    post,
    path = "/api/v3/task_instance/{id}/log_error_worker_node",
    params(("id" = i64, Path, description = "Task instance ID")),
    request_body = LogWorkerNodeErrorRequest,
    responses((status = 200, description = "Error recorded", body = TaskInstanceResponse)),
    tag = "task_instance"
)]
pub async fn log_error_worker_node(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<LogWorkerNodeErrorRequest>,
) -> ApiResult<Json<TaskInstanceResponse>> {
    let row = state
        .db
        .log_error_worker_node(id, &req.description, req.stderr_tail.as_deref())
        .await?;
    Ok(Json(row.into()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogResourceErrorRequest {
    pub description: String,
}

/// POST /task_instance/:id/log_resource_error - the distributor's poll saw
/// the cluster kill this instance for memory or runtime
#[utoipa::path(
    post,
    path = "/api/v3/task_instance/{id}/log_resource_error",
    params(("id" = i64, Path, description = "Task instance ID")),
    request_body = LogResourceErrorRequest,
    responses((status = 200, description = "Error recorded", body = TaskInstanceResponse)),
    tag = "task_instance"
)]
pub async fn log_resource_error(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<LogResourceErrorRequest>,
) -> ApiResult<Json<TaskInstanceResponse>> {
    let row = state.db.log_resource_error(id, &req.description).await?;
    Ok(Json(row.into()))
}
