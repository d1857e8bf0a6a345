// Binding routes: tools, templates, nodes, DAGs, workflows, runs, arrays
// and tasks. Everything here is get-or-create; clients re-binding after a
// resume converge on the same rows.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json, Router};
use jobmon_storage::models::{CreateTask, CreateTaskTemplateVersion, CreateWorkflow};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::Identity;
use crate::error::ApiResult;
use crate::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/tool", post(create_tool))
        .route("/tool/:tool_id/tool_version", post(create_tool_version))
        .route("/task_template", post(create_task_template))
        .route(
            "/task_template/:task_template_id/task_template_version",
            post(create_task_template_version),
        )
        .route("/node/bind", post(bind_nodes))
        .route("/dag/bind", post(bind_dag))
        .route("/workflow/bind", post(bind_workflow))
        .route("/workflow/:workflow_id/workflow_run", post(create_workflow_run))
        .route("/workflow/:workflow_id/array", post(create_array))
        .route("/workflow/:workflow_id/tasks", post(bind_tasks))
        .route("/task_resources", post(create_task_resources))
        .with_state(state)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateToolRequest {
    pub name: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ToolResponse {
    pub id: i64,
    pub name: String,
}

/// POST /tool - get or create a tool by name
#[utoipa::path(
    post,
    path = "/api/v3/tool",
    request_body = CreateToolRequest,
    responses(
        (status = 200, description = "Tool bound", body = ToolResponse),
        (status = 500, description = "Internal server error")
    ),
    tag = "bind"
)]
pub async fn create_tool(
    State(state): State<AppState>,
    Json(req): Json<CreateToolRequest>,
) -> ApiResult<Json<ToolResponse>> {
    let row = state.db.get_or_create_tool(&req.name).await?;
    Ok(Json(ToolResponse {
        id: row.id,
        name: row.name,
    }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ToolVersionResponse {
    pub id: i64,
    pub tool_id: i64,
}

/// POST /tool/:tool_id/tool_version
#[utoipa::path(
    post,
    path = "/api/v3/tool/{tool_id}/tool_version",
    params(("tool_id" = i64, Path, description = "Tool ID")),
    responses(
        (status = 201, description = "Tool version created", body = ToolVersionResponse)
    ),
    tag = "bind"
)]
pub async fn create_tool_version(
    State(state): State<AppState>,
    Path(tool_id): Path<i64>,
) -> ApiResult<(StatusCode, Json<ToolVersionResponse>)> {
    let row = state.db.create_tool_version(tool_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(ToolVersionResponse {
            id: row.id,
            tool_id: row.tool_id,
        }),
    ))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTaskTemplateRequest {
    pub tool_id: i64,
    pub name: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskTemplateResponse {
    pub id: i64,
    pub tool_id: i64,
    pub name: String,
}

/// POST /task_template
#[utoipa::path(
    post,
    path = "/api/v3/task_template",
    request_body = CreateTaskTemplateRequest,
    responses((status = 200, description = "Template bound", body = TaskTemplateResponse)),
    tag = "bind"
)]
pub async fn create_task_template(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskTemplateRequest>,
) -> ApiResult<Json<TaskTemplateResponse>> {
    let row = state
        .db
        .get_or_create_task_template(req.tool_id, &req.name)
        .await?;
    Ok(Json(TaskTemplateResponse {
        id: row.id,
        tool_id: row.tool_id,
        name: row.name,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTaskTemplateVersionRequest {
    pub tool_version_id: i64,
    pub command_template: String,
    #[serde(default)]
    pub node_args: Vec<String>,
    #[serde(default)]
    pub task_args: Vec<String>,
    #[serde(default)]
    pub op_args: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskTemplateVersionResponse {
    pub id: i64,
    pub task_template_id: i64,
    pub tool_version_id: i64,
    pub arg_mapping_hash: String,
}

/// POST /task_template/:id/task_template_version
#[utoipa::path(
    post,
    path = "/api/v3/task_template/{task_template_id}/task_template_version",
    params(("task_template_id" = i64, Path, description = "Task template ID")),
    request_body = CreateTaskTemplateVersionRequest,
    responses(
        (status = 200, description = "Template version bound", body = TaskTemplateVersionResponse)
    ),
    tag = "bind"
)]
pub async fn create_task_template_version(
    State(state): State<AppState>,
    Path(task_template_id): Path<i64>,
    Json(req): Json<CreateTaskTemplateVersionRequest>,
) -> ApiResult<Json<TaskTemplateVersionResponse>> {
    let row = state
        .db
        .get_or_create_task_template_version(CreateTaskTemplateVersion {
            task_template_id,
            tool_version_id: req.tool_version_id,
            command_template: req.command_template,
            node_args: req.node_args,
            task_args: req.task_args,
            op_args: req.op_args,
        })
        .await?;
    Ok(Json(TaskTemplateVersionResponse {
        id: row.id,
        task_template_id: row.task_template_id,
        tool_version_id: row.tool_version_id,
        arg_mapping_hash: row.arg_mapping_hash,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BindNodesRequest {
    /// (task_template_version_id, node_args_hash) pairs
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct NodeSpec {
    pub task_template_version_id: i64,
    pub node_args_hash: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BindNodesResponse {
    /// Node ids in input order
    pub node_ids: Vec<i64>,
}

/// POST /node/bind - get or create a batch of nodes
#[utoipa::path(
    post,
    path = "/api/v3/node/bind",
    request_body = BindNodesRequest,
    responses((status = 200, description = "Nodes bound", body = BindNodesResponse)),
    tag = "bind"
)]
pub async fn bind_nodes(
    State(state): State<AppState>,
    Json(req): Json<BindNodesRequest>,
) -> ApiResult<Json<BindNodesResponse>> {
    let pairs: Vec<(i64, String)> = req
        .nodes
        .into_iter()
        .map(|n| (n.task_template_version_id, n.node_args_hash))
        .collect();
    let rows = state.db.get_or_create_nodes(&pairs).await?;
    Ok(Json(BindNodesResponse {
        node_ids: rows.into_iter().map(|n| n.id).collect(),
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BindDagRequest {
    pub node_ids: Vec<i64>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct EdgeSpec {
    pub upstream_node_id: i64,
    pub downstream_node_id: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BindDagResponse {
    pub id: i64,
    pub hash: String,
}

/// POST /dag/bind - get or create a content-addressed DAG
#[utoipa::path(
    post,
    path = "/api/v3/dag/bind",
    request_body = BindDagRequest,
    responses(
        (status = 200, description = "DAG bound", body = BindDagResponse),
        (status = 422, description = "Cycle or foreign edge")
    ),
    tag = "bind"
)]
pub async fn bind_dag(
    State(state): State<AppState>,
    Json(req): Json<BindDagRequest>,
) -> ApiResult<Json<BindDagResponse>> {
    let edges: Vec<(i64, i64)> = req
        .edges
        .iter()
        .map(|e| (e.upstream_node_id, e.downstream_node_id))
        .collect();
    let row = state.db.get_or_create_dag(&req.node_ids, &edges).await?;
    Ok(Json(BindDagResponse {
        id: row.id,
        hash: row.hash,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BindWorkflowRequest {
    pub tool_version_id: i64,
    pub dag_id: i64,
    pub workflow_args_hash: String,
    pub name: Option<String>,
    #[serde(default = "default_max_concurrently_running")]
    pub max_concurrently_running: i32,
}

fn default_max_concurrently_running() -> i32 {
    10_000
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkflowResponse {
    pub id: i64,
    pub status: String,
    pub user_name: String,
    pub max_concurrently_running: i32,
}

/// POST /workflow/bind - get or create a workflow by identity hash
#[utoipa::path(
    post,
    path = "/api/v3/workflow/bind",
    request_body = BindWorkflowRequest,
    responses((status = 200, description = "Workflow bound", body = WorkflowResponse)),
    tag = "bind"
)]
pub async fn bind_workflow(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<BindWorkflowRequest>,
) -> ApiResult<Json<WorkflowResponse>> {
    let row = state
        .db
        .create_workflow(CreateWorkflow {
            tool_version_id: req.tool_version_id,
            dag_id: req.dag_id,
            workflow_args_hash: req.workflow_args_hash,
            name: req.name,
            user_name: identity.user_name.clone(),
            max_concurrently_running: req.max_concurrently_running,
        })
        .await?;
    Ok(Json(WorkflowResponse {
        id: row.id,
        status: row.status,
        user_name: row.user_name,
        max_concurrently_running: row.max_concurrently_running,
    }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkflowRunResponse {
    pub id: i64,
    pub workflow_id: i64,
    pub status: String,
}

/// POST /workflow/:workflow_id/workflow_run - register a new run attempt
#[utoipa::path(
    post,
    path = "/api/v3/workflow/{workflow_id}/workflow_run",
    params(("workflow_id" = i64, Path, description = "Workflow ID")),
    responses(
        (status = 201, description = "Run created", body = WorkflowRunResponse),
        (status = 404, description = "Workflow not found"),
        (status = 503, description = "Another run is live")
    ),
    tag = "bind"
)]
pub async fn create_workflow_run(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(workflow_id): Path<i64>,
) -> ApiResult<(StatusCode, Json<WorkflowRunResponse>)> {
    let row = state
        .db
        .create_workflow_run(workflow_id, &identity.user_name)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(WorkflowRunResponse {
            id: row.id,
            workflow_id: row.workflow_id,
            status: row.status,
        }),
    ))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateArrayRequest {
    pub task_template_version_id: i64,
    pub name: String,
    #[serde(default = "default_max_concurrently_running")]
    pub max_concurrently_running: i32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ArrayResponse {
    pub id: i64,
    pub workflow_id: i64,
    pub name: String,
    pub batch_number: i32,
}

/// POST /workflow/:workflow_id/array - get or create the array for a template
#[utoipa::path(
    post,
    path = "/api/v3/workflow/{workflow_id}/array",
    params(("workflow_id" = i64, Path, description = "Workflow ID")),
    request_body = CreateArrayRequest,
    responses((status = 200, description = "Array bound", body = ArrayResponse)),
    tag = "bind"
)]
pub async fn create_array(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
    Json(req): Json<CreateArrayRequest>,
) -> ApiResult<Json<ArrayResponse>> {
    let row = state
        .db
        .get_or_create_array(
            workflow_id,
            req.task_template_version_id,
            &req.name,
            req.max_concurrently_running,
        )
        .await?;
    Ok(Json(ArrayResponse {
        id: row.id,
        workflow_id: row.workflow_id,
        name: row.name,
        batch_number: row.batch_number,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BindTasksRequest {
    pub array_id: i64,
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TaskSpec {
    pub node_id: i64,
    pub task_args_hash: String,
    pub name: String,
    pub command: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_resource_scale")]
    pub resource_scale: f64,
    pub task_resources_id: Option<i64>,
}

fn default_max_attempts() -> i32 {
    3
}

fn default_resource_scale() -> f64 {
    1.5
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BindTasksResponse {
    pub task_ids: Vec<i64>,
}

/// POST /workflow/:workflow_id/tasks - bind a batch of tasks
#[utoipa::path(
    post,
    path = "/api/v3/workflow/{workflow_id}/tasks",
    params(("workflow_id" = i64, Path, description = "Workflow ID")),
    request_body = BindTasksRequest,
    responses((status = 200, description = "Tasks bound", body = BindTasksResponse)),
    tag = "bind"
)]
pub async fn bind_tasks(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
    Json(req): Json<BindTasksRequest>,
) -> ApiResult<Json<BindTasksResponse>> {
    let inputs: Vec<CreateTask> = req
        .tasks
        .into_iter()
        .map(|t| CreateTask {
            node_id: t.node_id,
            task_args_hash: t.task_args_hash,
            name: t.name,
            command: t.command,
            max_attempts: t.max_attempts,
            resource_scale: t.resource_scale,
            task_resources_id: t.task_resources_id,
        })
        .collect();
    let rows = state.db.create_tasks(workflow_id, req.array_id, &inputs).await?;
    Ok(Json(BindTasksResponse {
        task_ids: rows.into_iter().map(|t| t.id).collect(),
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTaskResourcesRequest {
    pub requested_resources: serde_json::Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateTaskResourcesResponse {
    pub id: i64,
}

/// POST /task_resources - persist a resource request for dispatch
#[utoipa::path(
    post,
    path = "/api/v3/task_resources",
    request_body = CreateTaskResourcesRequest,
    responses((status = 201, description = "Resources stored", body = CreateTaskResourcesResponse)),
    tag = "bind"
)]
pub async fn create_task_resources(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskResourcesRequest>,
) -> ApiResult<(StatusCode, Json<CreateTaskResourcesResponse>)> {
    let id = state.db.create_task_resources(&req.requested_resources).await?;
    Ok((StatusCode::CREATED, Json(CreateTaskResourcesResponse { id })))
}
