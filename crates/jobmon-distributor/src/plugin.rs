// Cluster plugin boundary.
//
// The distributor is the only component that talks to the cluster, and it
// does so exclusively through this trait. Every call is wrapped in a
// timeout by the loop; a timed-out submission leaves the whole batch with
// no distributor id.

use std::time::Duration;

use async_trait::async_trait;
use jobmon_core::TaskResourcesSpec;

/// One instance inside a submission batch.
#[derive(Debug, Clone)]
pub struct BatchInstance {
    pub task_instance_id: i64,
    pub command: String,
    pub resources: TaskResourcesSpec,
}

/// A homogeneous submission unit: same array, same batch, same resources.
#[derive(Debug, Clone)]
pub struct ArrayBatch {
    pub array_id: i64,
    pub batch_number: i32,
    pub task_resources_id: Option<i64>,
    pub instances: Vec<BatchInstance>,
}

/// What the cluster reports for a distributor id on poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterTaskState {
    /// Still pending or running
    Active,
    /// Finished; the worker is expected to have reported its own result
    Finished,
    /// Gone without a result
    Lost,
    /// Killed by the cluster (preemption, operator, signal)
    Killed,
    /// Killed for memory or runtime exhaustion
    ResourceKilled,
}

#[async_trait]
pub trait ClusterPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Submit a batch; returns (task_instance_id, distributor_id) pairs.
    async fn submit_array(&self, batch: &ArrayBatch) -> anyhow::Result<Vec<(i64, String)>>;

    /// Report the state of the given distributor ids. Ids the cluster no
    /// longer knows should be reported Lost, not omitted.
    async fn poll(&self, distributor_ids: &[String])
        -> anyhow::Result<Vec<(String, ClusterTaskState)>>;

    /// Kill the given distributor ids. Best effort; the kill sweep
    /// reconciles state afterwards.
    async fn kill(&self, distributor_ids: &[String]) -> anyhow::Result<()>;
}

/// Run a plugin call under the configured deadline.
pub async fn with_timeout<T>(
    duration: Duration,
    operation: &str,
    fut: impl std::future::Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "cluster plugin {} timed out after {:?}",
            operation,
            duration
        )),
    }
}
