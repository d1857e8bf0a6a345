// Array batch routes: the distributor's bulk transitions.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiResult;
use crate::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/array/:array_id/queue_task_batch", post(queue_task_batch))
        .route(
            "/array/:array_id/transition_to_launched",
            post(transition_to_launched),
        )
        .route(
            "/array/:array_id/transition_to_killed",
            post(transition_to_killed),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct QueueTaskBatchRequest {
    pub task_ids: Vec<i64>,
    pub task_resources_id: Option<i64>,
    pub workflow_run_id: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QueueTaskBatchResponse {
    pub array_id: i64,
    pub batch_number: i32,
    pub task_instance_ids: Vec<i64>,
}

/// POST /array/:array_id/queue_task_batch - atomically queue a batch and
/// create its task instances
#[utoipa::path(
    post,
    path = "/api/v3/array/{array_id}/queue_task_batch",
    params(("array_id" = i64, Path, description = "Array ID")),
    request_body = QueueTaskBatchRequest,
    responses(
        (status = 200, description = "Batch queued", body = QueueTaskBatchResponse),
        (status = 404, description = "Array not found")
    ),
    tag = "array"
)]
pub async fn queue_task_batch(
    State(state): State<AppState>,
    Path(array_id): Path<i64>,
    Json(req): Json<QueueTaskBatchRequest>,
) -> ApiResult<Json<QueueTaskBatchResponse>> {
    let batch = state
        .db
        .queue_task_batch(
            array_id,
            &req.task_ids,
            req.task_resources_id,
            req.workflow_run_id,
        )
        .await?;
    Ok(Json(QueueTaskBatchResponse {
        array_id: batch.array_id,
        batch_number: batch.batch_number,
        task_instance_ids: batch.task_instance_ids,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TransitionToLaunchedRequest {
    pub batch_number: i32,
    /// Seconds until the first heartbeat is due
    pub next_report_increment: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BatchTransitionResponse {
    pub transitioned: u64,
}

/// POST /array/:array_id/transition_to_launched
#[utoipa::path(
    post,
    path = "/api/v3/array/{array_id}/transition_to_launched",
    params(("array_id" = i64, Path, description = "Array ID")),
    request_body = TransitionToLaunchedRequest,
    responses((status = 200, description = "Batch launched", body = BatchTransitionResponse)),
    tag = "array"
)]
pub async fn transition_to_launched(
    State(state): State<AppState>,
    Path(array_id): Path<i64>,
    Json(req): Json<TransitionToLaunchedRequest>,
) -> ApiResult<Json<BatchTransitionResponse>> {
    let transitioned = state
        .db
        .transition_to_launched(array_id, req.batch_number, req.next_report_increment)
        .await?;
    Ok(Json(BatchTransitionResponse { transitioned }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TransitionToKilledRequest {
    pub batch_number: i32,
}

/// POST /array/:array_id/transition_to_killed - confirm a kill sweep.
/// Present in every exposed API version; the distributor depends on it.
#[utoipa::path(
    post,
    path = "/api/v3/array/{array_id}/transition_to_killed",
    params(("array_id" = i64, Path, description = "Array ID")),
    request_body = TransitionToKilledRequest,
    responses((status = 200, description = "Batch killed", body = BatchTransitionResponse)),
    tag = "array"
)]
pub async fn transition_to_killed(
    State(state): State<AppState>,
    Path(array_id): Path<i64>,
    Json(req): Json<TransitionToKilledRequest>,
) -> ApiResult<Json<BatchTransitionResponse>> {
    let transitioned = state
        .db
        .transition_to_killed(array_id, req.batch_number)
        .await?;
    Ok(Json(BatchTransitionResponse { transitioned }))
}
