// Database models (internal, may differ from public DTOs)

use chrono::{DateTime, Utc};
use jobmon_core::{
    JobmonError, Result, TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus,
};
use sqlx::FromRow;

// ============================================
// Tool / template / node / dag
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ToolRow {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ToolVersionRow {
    pub id: i64,
    pub tool_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskTemplateRow {
    pub id: i64,
    pub tool_id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskTemplateVersionRow {
    pub id: i64,
    pub task_template_id: i64,
    pub tool_version_id: i64,
    pub command_template: String,
    pub node_args: Vec<String>,
    pub task_args: Vec<String>,
    pub op_args: Vec<String>,
    pub arg_mapping_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a task template version
#[derive(Debug, Clone)]
pub struct CreateTaskTemplateVersion {
    pub task_template_id: i64,
    pub tool_version_id: i64,
    pub command_template: String,
    pub node_args: Vec<String>,
    pub task_args: Vec<String>,
    pub op_args: Vec<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct NodeRow {
    pub id: i64,
    pub task_template_version_id: i64,
    pub node_args_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DagRow {
    pub id: i64,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

// ============================================
// Workflow / workflow run
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: i64,
    pub tool_version_id: i64,
    pub dag_id: i64,
    pub workflow_args_hash: String,
    pub name: Option<String>,
    pub user_name: String,
    pub status: String,
    pub status_date: DateTime<Utc>,
    pub max_concurrently_running: i32,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRow {
    pub fn workflow_status(&self) -> Result<WorkflowStatus> {
        self.status.parse().map_err(JobmonError::schema)
    }
}

/// Input for creating a workflow
#[derive(Debug, Clone)]
pub struct CreateWorkflow {
    pub tool_version_id: i64,
    pub dag_id: i64,
    pub workflow_args_hash: String,
    pub name: Option<String>,
    pub user_name: String,
    pub max_concurrently_running: i32,
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRunRow {
    pub id: i64,
    pub workflow_id: i64,
    pub user_name: String,
    pub status: String,
    pub status_date: DateTime<Utc>,
    pub heartbeat_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRunRow {
    pub fn run_status(&self) -> Result<WorkflowRunStatus> {
        self.status.parse().map_err(JobmonError::schema)
    }
}

// ============================================
// Array / task / task resources
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ArrayRow {
    pub id: i64,
    pub workflow_id: i64,
    pub task_template_version_id: i64,
    pub name: String,
    pub max_concurrently_running: i32,
    pub batch_number: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskResourcesRow {
    pub id: i64,
    pub requested_resources: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub workflow_id: i64,
    pub node_id: i64,
    pub array_id: i64,
    pub task_args_hash: String,
    pub name: String,
    pub command: String,
    pub status: String,
    pub status_date: DateTime<Utc>,
    pub num_attempts: i32,
    pub max_attempts: i32,
    pub resource_scale: f64,
    pub task_resources_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl TaskRow {
    pub fn task_status(&self) -> Result<TaskStatus> {
        self.status.parse().map_err(JobmonError::schema)
    }

    pub fn retries_remaining(&self) -> bool {
        self.num_attempts < self.max_attempts
    }
}

/// Input for binding one task to a workflow
#[derive(Debug, Clone)]
pub struct CreateTask {
    pub node_id: i64,
    pub task_args_hash: String,
    pub name: String,
    pub command: String,
    pub max_attempts: i32,
    pub resource_scale: f64,
    pub task_resources_id: Option<i64>,
}

// ============================================
// Task instance
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct TaskInstanceRow {
    pub id: i64,
    pub task_id: i64,
    pub workflow_run_id: i64,
    pub array_id: i64,
    pub array_batch_num: i32,
    pub task_resources_id: Option<i64>,
    pub status: String,
    pub status_date: DateTime<Utc>,
    pub distributor_id: Option<String>,
    pub nodename: Option<String>,
    pub stdout_log: Option<String>,
    pub stderr_log: Option<String>,
    pub report_by_date: Option<DateTime<Utc>>,
    pub wallclock_seconds: Option<f64>,
    pub maxrss_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl TaskInstanceRow {
    pub fn instance_status(&self) -> Result<TaskInstanceStatus> {
        self.status.parse().map_err(JobmonError::schema)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskInstanceErrorLogRow {
    pub id: i64,
    pub task_instance_id: i64,
    pub description: String,
    pub error_time: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskStatusAuditRow {
    pub id: i64,
    pub task_id: i64,
    pub previous_status: String,
    pub new_status: String,
    pub status_date: DateTime<Utc>,
}

// ============================================
// Query projections
// ============================================

/// (status, count) pair for overview endpoints
#[derive(Debug, Clone, FromRow)]
pub struct StatusCountRow {
    pub status: String,
    pub count: i64,
}

/// (template name, status, count) for the template overview
#[derive(Debug, Clone, FromRow)]
pub struct TemplateStatusCountRow {
    pub task_template_name: String,
    pub status: String,
    pub count: i64,
}

/// One row of the operator-facing task table
#[derive(Debug, Clone, FromRow)]
pub struct TaskSummaryRow {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub status_date: DateTime<Utc>,
    pub num_attempts: i32,
    pub max_attempts: i32,
    pub array_name: String,
}

/// Errors grouped by identical description
#[derive(Debug, Clone, FromRow)]
pub struct ClusteredErrorRow {
    pub description: String,
    pub occurrences: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sample_task_instance_id: i64,
}

/// Template-level DAG shape: a template and the templates directly below it
#[derive(Debug, Clone, FromRow)]
pub struct TemplateDagEdgeRow {
    pub name: String,
    pub downstream_task_template_id: i64,
}

/// Usage sample feeding resource statistics
#[derive(Debug, Clone, FromRow)]
pub struct UsageSampleRow {
    pub maxrss_bytes: Option<i64>,
    pub wallclock_seconds: Option<f64>,
}

/// A queued instance the distributor may claim, with its dispatch context
#[derive(Debug, Clone, FromRow)]
pub struct QueuedInstanceRow {
    pub id: i64,
    pub task_id: i64,
    pub array_id: i64,
    pub array_batch_num: i32,
    pub task_resources_id: Option<i64>,
    pub command: String,
    pub requested_resources: Option<serde_json::Value>,
}

/// A task waiting for a resource rebind, with its last request
#[derive(Debug, Clone, FromRow)]
pub struct AdjustingTaskRow {
    pub id: i64,
    pub array_id: i64,
    pub resource_scale: f64,
    pub requested_resources: Option<serde_json::Value>,
}

/// A batch of kill-flagged instances, grouped for one plugin kill call
#[derive(Debug, Clone, FromRow)]
pub struct KillBatchRow {
    pub array_id: i64,
    pub array_batch_num: i32,
    pub distributor_ids: Vec<String>,
}
