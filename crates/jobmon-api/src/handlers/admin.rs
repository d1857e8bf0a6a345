// Admin routes: bulk task status override.

use axum::extract::State;
use axum::routing::put;
use axum::{Extension, Json, Router};
use jobmon_core::states::TaskStatus;
use jobmon_core::JobmonError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::Identity;
use crate::error::ApiResult;
use crate::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/task/update_statuses", put(update_task_statuses))
        .with_state(state)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateTaskStatusesRequest {
    pub task_ids: Vec<i64>,
    /// Single-letter target status code
    pub new_status: String,
    /// Fan out through every downstream task in the DAG
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UpdateTaskStatusesResponse {
    pub tasks_updated: u64,
}

/// PUT /task/update_statuses - force a batch of tasks to a status. Capped
/// at 10 000 tasks per call, recursion included.
#[utoipa::path(
    put,
    path = "/api/v3/task/update_statuses",
    request_body = UpdateTaskStatusesRequest,
    responses(
        (status = 200, description = "Statuses updated", body = UpdateTaskStatusesResponse),
        (status = 403, description = "Not the owner"),
        (status = 422, description = "Over the ceiling or bad status")
    ),
    tag = "admin"
)]
pub async fn update_task_statuses(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<UpdateTaskStatusesRequest>,
) -> ApiResult<Json<UpdateTaskStatusesResponse>> {
    let new_status: TaskStatus = req.new_status.parse().map_err(JobmonError::schema)?;

    // Ownership is checked against the workflow of the first task; the
    // storage layer rejects batches spanning workflows when recursing.
    if let Some(first) = req.task_ids.first() {
        if let Some(task) = state.db.get_task(*first).await? {
            if let Some(workflow) = state.db.get_workflow(task.workflow_id).await? {
                identity.authorize_owner(&workflow.user_name)?;
            }
        }
    }

    let updated = state
        .db
        .bulk_update_task_status(&req.task_ids, new_status, req.recursive)
        .await?;
    Ok(Json(UpdateTaskStatusesResponse {
        tasks_updated: updated,
    }))
}
