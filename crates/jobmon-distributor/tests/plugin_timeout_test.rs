// Plugin calls must respect the per-call deadline: a hung cluster adapter
// turns into an error the loop converts to no-distributor-id, never a stuck
// controller.

use std::time::Duration;

use async_trait::async_trait;
use jobmon_core::TaskResourcesSpec;
use jobmon_distributor::plugin::{
    with_timeout, ArrayBatch, BatchInstance, ClusterPlugin, ClusterTaskState,
};

struct HungPlugin;

#[async_trait]
impl ClusterPlugin for HungPlugin {
    fn name(&self) -> &str {
        "hung"
    }

    async fn submit_array(&self, _batch: &ArrayBatch) -> anyhow::Result<Vec<(i64, String)>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        unreachable!("submission never returns");
    }

    async fn poll(
        &self,
        _distributor_ids: &[String],
    ) -> anyhow::Result<Vec<(String, ClusterTaskState)>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        unreachable!("poll never returns");
    }

    async fn kill(&self, _distributor_ids: &[String]) -> anyhow::Result<()> {
        Ok(())
    }
}

fn one_instance_batch() -> ArrayBatch {
    ArrayBatch {
        array_id: 1,
        batch_number: 1,
        task_resources_id: None,
        instances: vec![BatchInstance {
            task_instance_id: 1,
            command: "true".to_string(),
            resources: TaskResourcesSpec::default(),
        }],
    }
}

#[tokio::test(start_paused = true)]
async fn hung_submission_times_out() {
    let plugin = HungPlugin;
    let err = with_timeout(
        Duration::from_secs(5),
        "submit_array",
        plugin.submit_array(&one_instance_batch()),
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("timed out"), "{}", err);
    assert!(err.to_string().contains("submit_array"));
}

#[tokio::test(start_paused = true)]
async fn hung_poll_times_out() {
    let plugin = HungPlugin;
    let err = with_timeout(
        Duration::from_secs(5),
        "poll",
        plugin.poll(&["proc-1-1".to_string()]),
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn fast_call_passes_through() {
    let plugin = HungPlugin;
    with_timeout(
        Duration::from_secs(5),
        "kill",
        plugin.kill(&["proc-1-1".to_string()]),
    )
    .await
    .unwrap();
}
