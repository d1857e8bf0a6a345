// The distributor loop: a single controller bound to one workflow run.
//
// Per tick: honor kills, rebind adjusting tasks with scaled resources,
// drain queued work under the concurrency caps, instantiate, submit array
// batches, poll outstanding cluster ids. All mutable state (outstanding
// ids, rosters) is owned here; the plugin never mutates anything shared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jobmon_core::{DistributorConfig, JobmonError, TaskResourcesSpec};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::{ApiClient, QueuedInstance};
use crate::plugin::{with_timeout, ArrayBatch, BatchInstance, ClusterPlugin, ClusterTaskState};
use crate::readiness::print_ready;
use crate::scaling::scale_resources;

pub struct Distributor {
    client: ApiClient,
    plugin: Arc<dyn ClusterPlugin>,
    config: DistributorConfig,
    workflow_run_id: i64,
    workflow_id: i64,
    /// distributor_id -> task_instance_id for everything on the cluster
    outstanding: HashMap<String, i64>,
    launched: bool,
    /// Hot resume requested: stop taking new work, let in-flight finish
    draining_down: bool,
}

impl Distributor {
    pub async fn bind(
        client: ApiClient,
        plugin: Arc<dyn ClusterPlugin>,
        config: DistributorConfig,
        workflow_run_id: i64,
    ) -> Result<Self> {
        let run = client
            .get_workflow_run(workflow_run_id)
            .await
            .context("workflow run lookup failed")?;

        client
            .update_run_status(workflow_run_id, "L")
            .await
            .context("linking failed")?;
        client
            .update_run_status(workflow_run_id, "B")
            .await
            .context("binding failed")?;

        info!(
            workflow_run_id,
            workflow_id = run.workflow_id,
            plugin = plugin.name(),
            "Distributor bound to workflow run"
        );

        Ok(Self {
            client,
            plugin,
            config,
            workflow_run_id,
            workflow_id: run.workflow_id,
            outstanding: HashMap::new(),
            launched: false,
            draining_down: false,
        })
    }

    /// Run until the workflow finishes, the run is taken over, or shutdown
    /// is signalled. Prints the readiness marker once before the first tick.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        print_ready();

        let mut heartbeat = tokio::time::interval(Duration::from_secs(
            self.config.heartbeat_interval_seconds.max(1),
        ));
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.poll_interval_seconds.max(1),
        ));

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Distributor shutting down");
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    if !self.beat().await {
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        // Integration failures are absorbed: record and keep
                        // the loop alive, state is reconciled next tick.
                        error!(error = %e, "Distributor tick failed");
                    }
                    if self.finished().await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Refresh the run heartbeat; returns false when the run is gone or was
    /// taken over and the loop should exit.
    async fn beat(&mut self) -> bool {
        match self.client.log_heartbeat(self.workflow_run_id).await {
            Ok(body) => {
                match body.get("status").and_then(|s| s.as_str()) {
                    Some("C") => {
                        warn!("Cold resume requested; relinquishing immediately");
                        false
                    }
                    Some("H") => {
                        if !self.draining_down {
                            warn!("Hot resume requested; draining down");
                            self.draining_down = true;
                        }
                        true
                    }
                    _ => true,
                }
            }
            Err(JobmonError::InvalidTransition { .. }) | Err(JobmonError::NotFound(_)) => {
                warn!("Workflow run is terminal; stopping heartbeats");
                false
            }
            Err(e) => {
                error!(error = %e, "Heartbeat failed");
                true
            }
        }
    }

    async fn tick(&mut self) -> Result<()> {
        self.sweep_kills().await?;
        if !self.draining_down {
            self.rebind_adjusting().await?;
            self.dispatch_queued().await?;
        }
        self.poll_outstanding().await?;
        Ok(())
    }

    /// Step 6 of the loop contract: plugin kill first, then the batch
    /// transition that finalizes tasks and instances.
    async fn sweep_kills(&mut self) -> Result<()> {
        let batches = self.client.kill_batches(self.workflow_run_id).await?;
        for batch in batches {
            info!(
                array_id = batch.array_id,
                batch_number = batch.array_batch_num,
                instances = batch.distributor_ids.len(),
                "Kill sweep"
            );
            if !batch.distributor_ids.is_empty() {
                if let Err(e) = with_timeout(
                    Duration::from_secs(self.config.submit_timeout_seconds),
                    "kill",
                    self.plugin.kill(&batch.distributor_ids),
                )
                .await
                {
                    error!(error = %e, "Plugin kill failed; sweeping anyway");
                }
                for id in &batch.distributor_ids {
                    self.outstanding.remove(id);
                }
            }
            self.client
                .transition_to_killed(batch.array_id, batch.array_batch_num)
                .await?;
        }
        Ok(())
    }

    /// Rebind AdjustingResources tasks with a scaled request (A -> Q).
    async fn rebind_adjusting(&mut self) -> Result<()> {
        let adjusting = self.client.adjusting_tasks(self.workflow_run_id).await?;
        if adjusting.is_empty() {
            return Ok(());
        }

        // One rebind per array; each task's own scale factor applies, so the
        // batch resources use the largest scaled spec in the group.
        let mut per_array: HashMap<i64, Vec<&crate::client::AdjustingTask>> = HashMap::new();
        for task in &adjusting {
            per_array.entry(task.array_id).or_default().push(task);
        }

        for (array_id, tasks) in per_array {
            let scaled: TaskResourcesSpec = tasks
                .iter()
                .map(|t| scale_resources(t.requested_resources.as_ref(), t.resource_scale))
                .reduce(|a, b| TaskResourcesSpec {
                    memory_bytes: a.memory_bytes.max(b.memory_bytes),
                    runtime_seconds: a.runtime_seconds.max(b.runtime_seconds),
                    cores: a.cores.max(b.cores),
                    queue: a.queue.or(b.queue),
                })
                .unwrap_or_default();

            let resources_value =
                serde_json::to_value(&scaled).context("serializing scaled resources")?;
            let task_resources_id = self.client.create_task_resources(&resources_value).await?;
            let task_ids: Vec<i64> = tasks.iter().map(|t| t.task_id).collect();

            info!(
                array_id,
                tasks = task_ids.len(),
                "Rebinding adjusting tasks with scaled resources"
            );
            self.client
                .queue_task_batch(
                    array_id,
                    &task_ids,
                    Some(task_resources_id),
                    self.workflow_run_id,
                )
                .await?;
        }
        Ok(())
    }

    /// Steps 2-4: drain, instantiate, submit in array batches.
    async fn dispatch_queued(&mut self) -> Result<()> {
        let queued = self
            .client
            .queued_task_instances(self.workflow_run_id, self.config.task_instance_batch_size)
            .await?;
        if queued.is_empty() {
            return Ok(());
        }

        let all_ids: Vec<i64> = queued.iter().map(|q| q.task_instance_id).collect();
        let claimed = self.client.instantiate_task_instances(&all_ids).await?;
        let claimed_set: std::collections::HashSet<i64> = claimed.into_iter().collect();
        let claimed_instances: Vec<QueuedInstance> = queued
            .into_iter()
            .filter(|q| claimed_set.contains(&q.task_instance_id))
            .collect();

        for batch in partition_batches(claimed_instances) {
            self.submit_batch(batch).await;
        }
        Ok(())
    }

    async fn submit_batch(&mut self, batch: ArrayBatch) {
        debug!(
            array_id = batch.array_id,
            batch_number = batch.batch_number,
            instances = batch.instances.len(),
            "Submitting array batch"
        );

        let submitted = with_timeout(
            Duration::from_secs(self.config.submit_timeout_seconds),
            "submit_array",
            self.plugin.submit_array(&batch),
        )
        .await;

        match submitted {
            Ok(pairs) => {
                for (instance_id, distributor_id) in &pairs {
                    if let Err(e) = self
                        .client
                        .log_distributor_id(
                            *instance_id,
                            distributor_id,
                            self.config.report_by_buffer_seconds,
                        )
                        .await
                    {
                        error!(
                            task_instance_id = instance_id,
                            error = %e,
                            "Failed to record distributor id"
                        );
                    }
                    self.outstanding.insert(distributor_id.clone(), *instance_id);
                }

                if let Err(e) = self
                    .client
                    .transition_to_launched(
                        batch.array_id,
                        batch.batch_number,
                        self.config.report_by_buffer_seconds,
                    )
                    .await
                {
                    error!(error = %e, "transition_to_launched failed");
                }

                if !self.launched {
                    self.launched = true;
                    let _ = self.client.update_run_status(self.workflow_run_id, "I").await;
                    let _ = self.client.update_run_status(self.workflow_run_id, "O").await;
                    let _ = self.client.update_run_status(self.workflow_run_id, "R").await;
                }
            }
            Err(e) => {
                // Timed-out or failed submission: nothing got an id; the
                // aggregation rule decides retry or fatal per task.
                warn!(
                    array_id = batch.array_id,
                    error = %e,
                    "Batch submission failed; marking instances without distributor id"
                );
                for instance in &batch.instances {
                    if let Err(log_err) = self
                        .client
                        .log_no_distributor_id(instance.task_instance_id, &e.to_string())
                        .await
                    {
                        error!(
                            task_instance_id = instance.task_instance_id,
                            error = %log_err,
                            "Failed to record missing distributor id"
                        );
                    }
                }
            }
        }
    }

    /// Step 5: poll the plugin for everything outstanding and reconcile.
    async fn poll_outstanding(&mut self) -> Result<()> {
        if self.outstanding.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = self.outstanding.keys().cloned().collect();
        let states = with_timeout(
            Duration::from_secs(self.config.submit_timeout_seconds),
            "poll",
            self.plugin.poll(&ids),
        )
        .await?;

        for (distributor_id, state) in states {
            let Some(&instance_id) = self.outstanding.get(&distributor_id) else {
                continue;
            };
            match state {
                ClusterTaskState::Active => {}
                ClusterTaskState::Finished => {
                    // The worker reports its own result; nothing to write.
                    self.outstanding.remove(&distributor_id);
                }
                ClusterTaskState::Lost => {
                    warn!(distributor_id = %distributor_id, "Instance gone without a result");
                    self.absorb(
                        self.client
                            .log_unknown_error(
                                instance_id,
                                "cluster no longer reports this distributor id",
                            )
                            .await,
                    );
                    self.outstanding.remove(&distributor_id);
                }
                ClusterTaskState::Killed => {
                    self.absorb(
                        self.client
                            .log_resource_error(instance_id, "killed by the cluster")
                            .await,
                    );
                    self.outstanding.remove(&distributor_id);
                }
                ClusterTaskState::ResourceKilled => {
                    self.absorb(
                        self.client
                            .log_resource_error(
                                instance_id,
                                "killed for memory or runtime exhaustion",
                            )
                            .await,
                    );
                    self.outstanding.remove(&distributor_id);
                }
            }
        }
        Ok(())
    }

    /// Lifecycle writes racing a worker's own report lose cleanly: the
    /// invalid transition is the idempotency contract doing its job.
    fn absorb(&self, result: jobmon_core::Result<serde_json::Value>) {
        if let Err(e) = result {
            debug!(error = %e, "Lifecycle write absorbed");
        }
    }

    /// Terminal check: every task in a terminal state ends the run.
    async fn finished(&mut self) -> Result<bool> {
        if !self.outstanding.is_empty() {
            return Ok(false);
        }

        let overview = self.client.workflow_overview(self.workflow_id).await?;
        let mut non_terminal = 0i64;
        let mut failed = 0i64;
        let mut total = 0i64;
        for count in &overview.task_status_counts {
            total += count.count;
            match count.status.as_str() {
                "D" => {}
                "F" | "H" => failed += count.count,
                _ => non_terminal += count.count,
            }
        }

        if total == 0 || non_terminal > 0 {
            return Ok(false);
        }

        let final_status = if failed == 0 { "D" } else { "E" };
        info!(
            workflow_run_id = self.workflow_run_id,
            final_status, failed, total, "Workflow run complete"
        );
        self.client
            .update_run_status(self.workflow_run_id, final_status)
            .await?;
        Ok(true)
    }
}

/// Partition claimed instances into homogeneous submission units: same
/// array, same batch number, same resource request.
pub fn partition_batches(instances: Vec<QueuedInstance>) -> Vec<ArrayBatch> {
    let mut grouped: HashMap<(i64, i32, Option<i64>), Vec<QueuedInstance>> = HashMap::new();
    for instance in instances {
        grouped
            .entry((
                instance.array_id,
                instance.array_batch_num,
                instance.task_resources_id,
            ))
            .or_default()
            .push(instance);
    }

    let mut batches: Vec<ArrayBatch> = grouped
        .into_iter()
        .map(|((array_id, batch_number, task_resources_id), members)| ArrayBatch {
            array_id,
            batch_number,
            task_resources_id,
            instances: members
                .into_iter()
                .map(|m| BatchInstance {
                    task_instance_id: m.task_instance_id,
                    command: m.command,
                    resources: m
                        .requested_resources
                        .as_ref()
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or_default(),
                })
                .collect(),
        })
        .collect();
    batches.sort_by_key(|b| (b.array_id, b.batch_number, b.task_resources_id));
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(id: i64, array_id: i64, batch: i32, resources: Option<i64>) -> QueuedInstance {
        QueuedInstance {
            task_instance_id: id,
            task_id: id,
            array_id,
            array_batch_num: batch,
            task_resources_id: resources,
            command: format!("echo {}", id),
            requested_resources: None,
        }
    }

    #[test]
    fn batches_split_on_array_and_batch_and_resources() {
        let batches = partition_batches(vec![
            queued(1, 10, 1, Some(5)),
            queued(2, 10, 1, Some(5)),
            queued(3, 10, 2, Some(5)),
            queued(4, 11, 1, Some(5)),
            queued(5, 10, 1, Some(6)),
        ]);

        assert_eq!(batches.len(), 4);
        let sizes: Vec<usize> = batches.iter().map(|b| b.instances.len()).collect();
        assert_eq!(sizes, vec![2, 1, 1, 1]);
    }

    #[test]
    fn empty_input_gives_no_batches() {
        assert!(partition_batches(Vec::new()).is_empty());
    }

    #[test]
    fn commands_survive_partitioning() {
        let batches = partition_batches(vec![queued(7, 1, 1, None)]);
        assert_eq!(batches[0].instances[0].command, "echo 7");
    }
}
