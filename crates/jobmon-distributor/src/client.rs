// HTTP client for the coordination API.
//
// Pinned to one API version at construction. Conflict responses (503 with
// error_kind "conflict") are retried with jitter; every other error is
// surfaced to the loop.

use std::time::Duration;

use anyhow::anyhow;
use jobmon_core::{JobmonError, Result};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_JITTER_MS: u64 = 250;

#[derive(Debug, Clone, Deserialize)]
pub struct QueuedInstance {
    pub task_instance_id: i64,
    pub task_id: i64,
    pub array_id: i64,
    pub array_batch_num: i32,
    pub task_resources_id: Option<i64>,
    pub command: String,
    pub requested_resources: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KillBatch {
    pub array_id: i64,
    pub array_batch_num: i32,
    pub distributor_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdjustingTask {
    pub task_id: i64,
    pub array_id: i64,
    pub resource_scale: f64,
    pub requested_resources: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueuedBatch {
    pub array_id: i64,
    pub batch_number: i32,
    pub task_instance_ids: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunDetail {
    pub id: i64,
    pub workflow_id: i64,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowOverview {
    pub workflow_id: i64,
    pub status: String,
    pub task_status_counts: Vec<StatusCount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error_kind: String,
    detail: String,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    retry_attempts: u32,
    retry_jitter_ms: u64,
}

impl ApiClient {
    /// `base_url` is the server root, e.g. http://localhost:9100; `version`
    /// selects the API version, normally v3.
    pub fn new(base_url: &str, version: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("{}/api/{}", base_url.trim_end_matches('/'), version),
            user: "anonymous".to_string(),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_jitter_ms: DEFAULT_RETRY_JITTER_MS,
        }
    }

    /// Identity sent with every request when the server has auth enabled.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    // ============================================
    // Workflow run
    // ============================================

    pub async fn get_workflow_run(&self, run_id: i64) -> Result<WorkflowRunDetail> {
        self.get(&format!("/workflow_run/{}", run_id)).await
    }

    pub async fn log_heartbeat(&self, run_id: i64) -> Result<serde_json::Value> {
        self.post(&format!("/workflow_run/{}/log_heartbeat", run_id), &json!({}))
            .await
    }

    pub async fn update_run_status(&self, run_id: i64, status: &str) -> Result<serde_json::Value> {
        self.put(
            &format!("/workflow_run/{}/update_status", run_id),
            &json!({ "status": status }),
        )
        .await
    }

    pub async fn queued_task_instances(
        &self,
        run_id: i64,
        limit: usize,
    ) -> Result<Vec<QueuedInstance>> {
        self.get(&format!(
            "/workflow_run/{}/queued_task_instances?limit={}",
            run_id, limit
        ))
        .await
    }

    pub async fn kill_batches(&self, run_id: i64) -> Result<Vec<KillBatch>> {
        self.get(&format!("/workflow_run/{}/kill_batches", run_id)).await
    }

    pub async fn adjusting_tasks(&self, run_id: i64) -> Result<Vec<AdjustingTask>> {
        self.get(&format!("/workflow_run/{}/adjusting_tasks", run_id)).await
    }

    pub async fn workflow_overview(&self, workflow_id: i64) -> Result<WorkflowOverview> {
        self.get(&format!("/workflow/{}/overview", workflow_id)).await
    }

    // ============================================
    // Array batches
    // ============================================

    pub async fn queue_task_batch(
        &self,
        array_id: i64,
        task_ids: &[i64],
        task_resources_id: Option<i64>,
        workflow_run_id: i64,
    ) -> Result<QueuedBatch> {
        self.post(
            &format!("/array/{}/queue_task_batch", array_id),
            &json!({
                "task_ids": task_ids,
                "task_resources_id": task_resources_id,
                "workflow_run_id": workflow_run_id,
            }),
        )
        .await
    }

    pub async fn transition_to_launched(
        &self,
        array_id: i64,
        batch_number: i32,
        next_report_increment: i64,
    ) -> Result<serde_json::Value> {
        self.post(
            &format!("/array/{}/transition_to_launched", array_id),
            &json!({
                "batch_number": batch_number,
                "next_report_increment": next_report_increment,
            }),
        )
        .await
    }

    pub async fn transition_to_killed(
        &self,
        array_id: i64,
        batch_number: i32,
    ) -> Result<serde_json::Value> {
        self.post(
            &format!("/array/{}/transition_to_killed", array_id),
            &json!({ "batch_number": batch_number }),
        )
        .await
    }

    // ============================================
    // Task instances
    // ============================================

    pub async fn instantiate_task_instances(&self, instance_ids: &[i64]) -> Result<Vec<i64>> {
        #[derive(Deserialize)]
        struct Response {
            task_instance_ids: Vec<i64>,
        }
        let response: Response = self
            .post(
                "/task_instance/instantiate_task_instances",
                &json!({ "task_instance_ids": instance_ids }),
            )
            .await?;
        Ok(response.task_instance_ids)
    }

    pub async fn log_distributor_id(
        &self,
        instance_id: i64,
        distributor_id: &str,
        next_report_increment: i64,
    ) -> Result<serde_json::Value> {
        self.post(
            &format!("/task_instance/{}/log_distributor_id", instance_id),
            &json!({
                "distributor_id": distributor_id,
                "next_report_increment": next_report_increment,
            }),
        )
        .await
    }

    pub async fn log_no_distributor_id(
        &self,
        instance_id: i64,
        description: &str,
    ) -> Result<serde_json::Value> {
        self.post(
            &format!("/task_instance/{}/log_no_distributor_id", instance_id),
            &json!({ "description": description }),
        )
        .await
    }

    pub async fn log_unknown_error(
        &self,
        instance_id: i64,
        description: &str,
    ) -> Result<serde_json::Value> {
        self.post(
            &format!("/task_instance/{}/log_unknown_error", instance_id),
            &json!({ "description": description }),
        )
        .await
    }

    pub async fn log_resource_error(
        &self,
        instance_id: i64,
        description: &str,
    ) -> Result<serde_json::Value> {
        self.post(
            &format!("/task_instance/{}/log_resource_error", instance_id),
            &json!({ "description": description }),
        )
        .await
    }

    pub async fn create_task_resources(
        &self,
        requested_resources: &serde_json::Value,
    ) -> Result<i64> {
        #[derive(Deserialize)]
        struct Response {
            id: i64,
        }
        let response: Response = self
            .post(
                "/task_resources",
                &json!({ "requested_resources": requested_resources }),
            )
            .await?;
        Ok(response.id)
    }

    // ============================================
    // Transport
    // ============================================

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(reqwest::Method::GET, path, None::<&()>).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.request(reqwest::Method::POST, path, Some(body)).await
    }

    async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.request(reqwest::Method::PUT, path, Some(body)).await
    }

    async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("x-jobmon-user", &self.user);
            if let Some(body) = body {
                request = request.json(body);
            }

            let outcome = match request.send().await {
                Ok(response) => self.decode(response).await,
                Err(e) => Err(JobmonError::integration(format!(
                    "request to {} failed: {}",
                    url, e
                ))),
            };

            match outcome {
                Err(e) if e.is_retryable() && attempt <= self.retry_attempts => {
                    let jitter = rand::thread_rng().gen_range(0..=self.retry_jitter_ms);
                    tracing::debug!(
                        url = %url,
                        attempt,
                        jitter_ms = jitter,
                        "Retrying after conflict"
                    );
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                }
                other => return other,
            }
        }
    }

    async fn decode<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| JobmonError::Internal(anyhow!("malformed response body: {}", e)));
        }

        let body: Option<ErrorBody> = response.json().await.ok();
        let (kind, detail) = body
            .map(|b| (b.error_kind, b.detail))
            .unwrap_or_else(|| ("unknown".to_string(), format!("http status {}", status)));

        Err(match kind.as_str() {
            "conflict" => JobmonError::conflict(detail),
            "not_found" => JobmonError::not_found(detail),
            "invalid_transition" => JobmonError::Integration(format!(
                "server rejected transition: {}",
                detail
            )),
            "unauthenticated" => JobmonError::Unauthenticated,
            "authorization_denied" => JobmonError::AuthorizationDenied(detail),
            "schema_violation" => JobmonError::schema(detail),
            _ => JobmonError::integration(detail),
        })
    }
}
