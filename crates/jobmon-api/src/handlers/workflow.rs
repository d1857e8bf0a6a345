// Workflow and workflow-run control routes.
//
// Destructive endpoints check ownership against the resolved identity; the
// run-facing routes here are the distributor's control surface.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use jobmon_core::states::WorkflowRunStatus;
use jobmon_core::JobmonError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/workflow/:workflow_id/update_max_concurrently_running",
            put(update_max_concurrently_running),
        )
        .route(
            "/workflow/:workflow_id/update_array_max_concurrently_running",
            put(update_array_max_concurrently_running),
        )
        .route("/get_max_concurrently_running", get(get_max_concurrently_running))
        .route("/task/:workflow_id/set_resume_state", post(set_resume_state))
        .route("/workflow/:workflow_id/stop", post(stop_workflow))
        .route("/workflow_run/:run_id", get(get_workflow_run))
        .route("/workflow_run/:run_id/log_heartbeat", post(log_heartbeat))
        .route("/workflow_run/:run_id/update_status", put(update_run_status))
        .route(
            "/workflow_run/:run_id/queued_task_instances",
            get(queued_task_instances),
        )
        .route("/workflow_run/:run_id/kill_batches", get(kill_batches))
        .route("/workflow_run/:run_id/adjusting_tasks", get(adjusting_tasks))
        .with_state(state)
}

async fn authorize_workflow(
    state: &AppState,
    identity: &Identity,
    workflow_id: i64,
) -> Result<(), ApiError> {
    let workflow = state
        .db
        .get_workflow(workflow_id)
        .await?
        .ok_or_else(|| JobmonError::not_found(format!("workflow {} does not exist", workflow_id)))?;
    identity.authorize_owner(&workflow.user_name)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateMaxTasksRequest {
    pub max_tasks: i32,
}

/// PUT /workflow/:workflow_id/update_max_concurrently_running
#[utoipa::path(
    put,
    path = "/api/v3/workflow/{workflow_id}/update_max_concurrently_running",
    params(("workflow_id" = i64, Path, description = "Workflow ID")),
    request_body = UpdateMaxTasksRequest,
    responses(
        (status = 200, description = "Cap updated"),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflow"
)]
pub async fn update_max_concurrently_running(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(workflow_id): Path<i64>,
    Json(req): Json<UpdateMaxTasksRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    authorize_workflow(&state, &identity, workflow_id).await?;
    state
        .db
        .update_max_concurrently_running(workflow_id, req.max_tasks)
        .await?;
    Ok(Json(serde_json::json!({ "max_tasks": req.max_tasks })))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateArrayMaxTasksRequest {
    pub task_template_version_id: i64,
    pub max_tasks: i32,
}

/// PUT /workflow/:workflow_id/update_array_max_concurrently_running
#[utoipa::path(
    put,
    path = "/api/v3/workflow/{workflow_id}/update_array_max_concurrently_running",
    params(("workflow_id" = i64, Path, description = "Workflow ID")),
    request_body = UpdateArrayMaxTasksRequest,
    responses(
        (status = 200, description = "Array cap updated"),
        (status = 404, description = "No matching array")
    ),
    tag = "workflow"
)]
pub async fn update_array_max_concurrently_running(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(workflow_id): Path<i64>,
    Json(req): Json<UpdateArrayMaxTasksRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    authorize_workflow(&state, &identity, workflow_id).await?;
    state
        .db
        .update_array_max_concurrently_running(
            workflow_id,
            req.task_template_version_id,
            req.max_tasks,
        )
        .await?;
    Ok(Json(serde_json::json!({ "max_tasks": req.max_tasks })))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MaxConcurrentlyRunningParams {
    pub workflow_id: i64,
}

/// GET /get_max_concurrently_running?workflow_id=N
#[utoipa::path(
    get,
    path = "/api/v3/get_max_concurrently_running",
    params(("workflow_id" = i64, Query, description = "Workflow ID")),
    responses(
        (status = 200, description = "Current cap"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflow"
)]
pub async fn get_max_concurrently_running(
    State(state): State<AppState>,
    Query(params): Query<MaxConcurrentlyRunningParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let max = state
        .db
        .get_max_concurrently_running(params.workflow_id)
        .await?
        .ok_or_else(|| {
            JobmonError::not_found(format!("workflow {} does not exist", params.workflow_id))
        })?;
    Ok(Json(serde_json::json!({ "max_concurrently_running": max })))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetResumeStateRequest {
    #[serde(default)]
    pub reset_if_running: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SetResumeStateResponse {
    pub workflow_id: i64,
    pub tasks_reset: u64,
    pub runs_terminated: u64,
}

/// POST /task/:workflow_id/set_resume_state - the resume protocol
#[utoipa::path(
    post,
    path = "/api/v3/task/{workflow_id}/set_resume_state",
    params(("workflow_id" = i64, Path, description = "Workflow ID")),
    request_body = SetResumeStateRequest,
    responses(
        (status = 200, description = "Tasks reset", body = SetResumeStateResponse),
        (status = 403, description = "Not the owner"),
        (status = 503, description = "A live run has not signalled resume")
    ),
    tag = "workflow"
)]
pub async fn set_resume_state(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(workflow_id): Path<i64>,
    Json(req): Json<SetResumeStateRequest>,
) -> ApiResult<Json<SetResumeStateResponse>> {
    authorize_workflow(&state, &identity, workflow_id).await?;
    let outcome = state
        .db
        .set_resume_state(workflow_id, req.reset_if_running)
        .await?;
    Ok(Json(SetResumeStateResponse {
        workflow_id: outcome.workflow_id,
        tasks_reset: outcome.tasks_reset,
        runs_terminated: outcome.runs_terminated,
    }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StopWorkflowResponse {
    pub tasks_halted: u64,
    pub instances_killed: u64,
}

/// POST /workflow/:workflow_id/stop
#[utoipa::path(
    post,
    path = "/api/v3/workflow/{workflow_id}/stop",
    params(("workflow_id" = i64, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Workflow stopping", body = StopWorkflowResponse),
        (status = 403, description = "Not the owner")
    ),
    tag = "workflow"
)]
pub async fn stop_workflow(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(workflow_id): Path<i64>,
) -> ApiResult<Json<StopWorkflowResponse>> {
    authorize_workflow(&state, &identity, workflow_id).await?;
    let outcome = state.db.stop_workflow(workflow_id).await?;
    Ok(Json(StopWorkflowResponse {
        tasks_halted: outcome.tasks_halted,
        instances_killed: outcome.instances_killed,
    }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkflowRunDetail {
    pub id: i64,
    pub workflow_id: i64,
    pub status: String,
    pub heartbeat_date: chrono::DateTime<chrono::Utc>,
}

/// GET /workflow_run/:run_id
#[utoipa::path(
    get,
    path = "/api/v3/workflow_run/{run_id}",
    params(("run_id" = i64, Path, description = "Workflow run ID")),
    responses(
        (status = 200, description = "Workflow run", body = WorkflowRunDetail),
        (status = 404, description = "Run not found")
    ),
    tag = "workflow_run"
)]
pub async fn get_workflow_run(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<WorkflowRunDetail>> {
    let run = state
        .db
        .get_workflow_run(run_id)
        .await?
        .ok_or_else(|| JobmonError::not_found(format!("workflow run {} does not exist", run_id)))?;
    Ok(Json(WorkflowRunDetail {
        id: run.id,
        workflow_id: run.workflow_id,
        status: run.status,
        heartbeat_date: run.heartbeat_date,
    }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HeartbeatResponse {
    pub workflow_run_id: i64,
    pub status: String,
    pub heartbeat_date: chrono::DateTime<chrono::Utc>,
}

/// POST /workflow_run/:run_id/log_heartbeat
#[utoipa::path(
    post,
    path = "/api/v3/workflow_run/{run_id}/log_heartbeat",
    params(("run_id" = i64, Path, description = "Workflow run ID")),
    responses(
        (status = 200, description = "Heartbeat recorded", body = HeartbeatResponse),
        (status = 409, description = "Run is terminal")
    ),
    tag = "workflow_run"
)]
pub async fn log_heartbeat(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let run = state.db.log_workflow_run_heartbeat(run_id).await?;
    Ok(Json(HeartbeatResponse {
        workflow_run_id: run.id,
        status: run.status,
        heartbeat_date: run.heartbeat_date,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateRunStatusRequest {
    /// Single-letter status code
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RunStatusResponse {
    pub workflow_run_id: i64,
    pub status: String,
}

/// PUT /workflow_run/:run_id/update_status
#[utoipa::path(
    put,
    path = "/api/v3/workflow_run/{run_id}/update_status",
    params(("run_id" = i64, Path, description = "Workflow run ID")),
    request_body = UpdateRunStatusRequest,
    responses(
        (status = 200, description = "Run transitioned", body = RunStatusResponse),
        (status = 409, description = "Invalid transition")
    ),
    tag = "workflow_run"
)]
pub async fn update_run_status(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    Json(req): Json<UpdateRunStatusRequest>,
) -> ApiResult<Json<RunStatusResponse>> {
    let requested: WorkflowRunStatus = req.status.parse().map_err(JobmonError::schema)?;
    let run = state.db.transition_workflow_run(run_id, requested).await?;
    Ok(Json(RunStatusResponse {
        workflow_run_id: run.id,
        status: run.status,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DrainParams {
    #[serde(default = "default_drain_limit")]
    pub limit: i64,
}

fn default_drain_limit() -> i64 {
    500
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QueuedInstance {
    pub task_instance_id: i64,
    pub task_id: i64,
    pub array_id: i64,
    pub array_batch_num: i32,
    pub task_resources_id: Option<i64>,
    pub command: String,
    pub requested_resources: Option<serde_json::Value>,
}

/// GET /workflow_run/:run_id/queued_task_instances - capacity-capped drain
#[utoipa::path(
    get,
    path = "/api/v3/workflow_run/{run_id}/queued_task_instances",
    params(
        ("run_id" = i64, Path, description = "Workflow run ID"),
        ("limit" = Option<i64>, Query, description = "Max instances (default 500)")
    ),
    responses((status = 200, description = "Claimable instances", body = Vec<QueuedInstance>)),
    tag = "workflow_run"
)]
pub async fn queued_task_instances(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    Query(params): Query<DrainParams>,
) -> ApiResult<Json<Vec<QueuedInstance>>> {
    let rows = state.db.queued_task_instances(run_id, params.limit).await?;
    Ok(Json(
        rows.into_iter()
            .map(|r| QueuedInstance {
                task_instance_id: r.id,
                task_id: r.task_id,
                array_id: r.array_id,
                array_batch_num: r.array_batch_num,
                task_resources_id: r.task_resources_id,
                command: r.command,
                requested_resources: r.requested_resources,
            })
            .collect(),
    ))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct KillBatch {
    pub array_id: i64,
    pub array_batch_num: i32,
    pub distributor_ids: Vec<String>,
}

/// GET /workflow_run/:run_id/kill_batches - batches awaiting the kill sweep
#[utoipa::path(
    get,
    path = "/api/v3/workflow_run/{run_id}/kill_batches",
    params(("run_id" = i64, Path, description = "Workflow run ID")),
    responses((status = 200, description = "Pending kill batches", body = Vec<KillBatch>)),
    tag = "workflow_run"
)]
pub async fn kill_batches(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<Vec<KillBatch>>> {
    let rows = state.db.get_kill_batches(run_id).await?;
    Ok(Json(
        rows.into_iter()
            .map(|r| KillBatch {
                array_id: r.array_id,
                array_batch_num: r.array_batch_num,
                distributor_ids: r.distributor_ids,
            })
            .collect(),
    ))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AdjustingTask {
    pub task_id: i64,
    pub array_id: i64,
    pub resource_scale: f64,
    pub requested_resources: Option<serde_json::Value>,
}

/// GET /workflow_run/:run_id/adjusting_tasks - tasks awaiting a resource rebind
#[utoipa::path(
    get,
    path = "/api/v3/workflow_run/{run_id}/adjusting_tasks",
    params(("run_id" = i64, Path, description = "Workflow run ID")),
    responses((status = 200, description = "Adjusting tasks", body = Vec<AdjustingTask>)),
    tag = "workflow_run"
)]
pub async fn adjusting_tasks(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<Vec<AdjustingTask>>> {
    let rows = state.db.adjusting_tasks(run_id).await?;
    Ok(Json(
        rows.into_iter()
            .map(|r| AdjustingTask {
                task_id: r.id,
                array_id: r.array_id,
                resource_scale: r.resource_scale,
                requested_resources: r.requested_resources,
            })
            .collect(),
    ))
}
