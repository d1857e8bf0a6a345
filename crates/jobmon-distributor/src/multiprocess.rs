// Local multiprocess plugin: runs batch commands as child processes on the
// distributor host. Exists so the whole dispatch path can be exercised
// without a cluster; the runtime limit maps to a resource kill the way a
// real scheduler would report one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::plugin::{ArrayBatch, ClusterPlugin, ClusterTaskState};

struct ManagedProcess {
    child: Child,
    deadline: Option<Instant>,
    resource_killed: bool,
}

pub struct MultiprocessPlugin {
    processes: Arc<Mutex<HashMap<String, ManagedProcess>>>,
}

impl MultiprocessPlugin {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for MultiprocessPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterPlugin for MultiprocessPlugin {
    fn name(&self) -> &str {
        "multiprocess"
    }

    async fn submit_array(&self, batch: &ArrayBatch) -> anyhow::Result<Vec<(i64, String)>> {
        let mut processes = self.processes.lock().await;
        let mut submitted = Vec::with_capacity(batch.instances.len());

        for instance in &batch.instances {
            let child = Command::new("sh")
                .arg("-c")
                .arg(&instance.command)
                .kill_on_drop(true)
                .spawn()?;
            let pid = child.id().unwrap_or_default();
            let distributor_id = format!("proc-{}-{}", instance.task_instance_id, pid);

            let deadline = instance
                .resources
                .runtime_seconds
                .map(|secs| Instant::now() + Duration::from_secs(secs.max(0) as u64));

            debug!(
                distributor_id = %distributor_id,
                command = %instance.command,
                "Spawned batch process"
            );
            processes.insert(
                distributor_id.clone(),
                ManagedProcess {
                    child,
                    deadline,
                    resource_killed: false,
                },
            );
            submitted.push((instance.task_instance_id, distributor_id));
        }

        Ok(submitted)
    }

    async fn poll(
        &self,
        distributor_ids: &[String],
    ) -> anyhow::Result<Vec<(String, ClusterTaskState)>> {
        let mut processes = self.processes.lock().await;
        let mut states = Vec::with_capacity(distributor_ids.len());

        for id in distributor_ids {
            let Some(managed) = processes.get_mut(id) else {
                states.push((id.clone(), ClusterTaskState::Lost));
                continue;
            };

            // Over-time processes are killed here, the way a scheduler
            // enforces its runtime limit.
            if let Some(deadline) = managed.deadline {
                if !managed.resource_killed && Instant::now() > deadline {
                    warn!(distributor_id = %id, "Runtime limit exceeded, killing");
                    let _ = managed.child.kill().await;
                    managed.resource_killed = true;
                }
            }

            let state = match managed.child.try_wait()? {
                None => ClusterTaskState::Active,
                Some(_) if managed.resource_killed => ClusterTaskState::ResourceKilled,
                Some(status) if status.success() => ClusterTaskState::Finished,
                Some(status) => {
                    // Signal deaths look like cluster kills; ordinary
                    // failures are the worker's to report.
                    if status.code().is_none() {
                        ClusterTaskState::Killed
                    } else {
                        ClusterTaskState::Finished
                    }
                }
            };

            if state != ClusterTaskState::Active {
                processes.remove(id);
            }
            states.push((id.clone(), state));
        }

        Ok(states)
    }

    async fn kill(&self, distributor_ids: &[String]) -> anyhow::Result<()> {
        let mut processes = self.processes.lock().await;
        for id in distributor_ids {
            if let Some(managed) = processes.get_mut(id) {
                let _ = managed.child.kill().await;
                debug!(distributor_id = %id, "Killed batch process");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::BatchInstance;
    use jobmon_core::TaskResourcesSpec;

    fn batch(instances: Vec<BatchInstance>) -> ArrayBatch {
        ArrayBatch {
            array_id: 1,
            batch_number: 1,
            task_resources_id: None,
            instances,
        }
    }

    fn instance(id: i64, command: &str, runtime: Option<i64>) -> BatchInstance {
        BatchInstance {
            task_instance_id: id,
            command: command.to_string(),
            resources: TaskResourcesSpec {
                runtime_seconds: runtime,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn successful_command_finishes() {
        let plugin = MultiprocessPlugin::new();
        let submitted = plugin
            .submit_array(&batch(vec![instance(1, "true", None)]))
            .await
            .unwrap();
        assert_eq!(submitted.len(), 1);
        let id = submitted[0].1.clone();

        // Give the child a moment to exit.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let states = plugin.poll(&[id]).await.unwrap();
        assert_eq!(states[0].1, ClusterTaskState::Finished);
    }

    #[tokio::test]
    async fn unknown_id_reports_lost() {
        let plugin = MultiprocessPlugin::new();
        let states = plugin.poll(&["proc-0-0".to_string()]).await.unwrap();
        assert_eq!(states[0].1, ClusterTaskState::Lost);
    }

    #[tokio::test]
    async fn killed_process_reports_killed() {
        let plugin = MultiprocessPlugin::new();
        let submitted = plugin
            .submit_array(&batch(vec![instance(2, "sleep 30", None)]))
            .await
            .unwrap();
        let id = submitted[0].1.clone();

        plugin.kill(&[id.clone()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let states = plugin.poll(&[id]).await.unwrap();
        assert_eq!(states[0].1, ClusterTaskState::Killed);
    }

    #[tokio::test]
    async fn over_time_process_reports_resource_killed() {
        let plugin = MultiprocessPlugin::new();
        let submitted = plugin
            .submit_array(&batch(vec![instance(3, "sleep 30", Some(0))]))
            .await
            .unwrap();
        let id = submitted[0].1.clone();

        tokio::time::sleep(Duration::from_millis(200)).await;
        // The poll enforces the limit: kill, reap, report.
        let states = plugin.poll(&[id]).await.unwrap();
        assert_eq!(states[0].1, ClusterTaskState::ResourceKilled);
    }
}
