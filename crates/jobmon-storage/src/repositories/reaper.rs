// Reaper sweeps: heartbeat expiry at workflow-run and task-instance
// granularity. One transaction per sweep per tick.

use std::collections::HashMap;

use jobmon_core::states::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus};
use jobmon_core::{fsm, JobmonError, Result, Transition};

use crate::db::{map_db_err, Database};
use crate::models::TaskRow;
use crate::repositories::{append_task_audits, AuditEntry};

/// A workflow run the reaper terminalized.
#[derive(Debug, Clone)]
pub struct ReapedRun {
    pub workflow_run_id: i64,
    pub workflow_id: i64,
    pub instances_expired: u64,
}

impl Database {
    /// Claim the singleton reaper lease for `ttl_seconds`. A holder renews
    /// its own lease freely; anyone else only takes over an expired one.
    pub async fn try_acquire_reaper_lease(&self, holder: &str, ttl_seconds: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO reaper_lease (id, holder, expires_at)
            VALUES (1, $1, now() + make_interval(secs => $2))
            ON CONFLICT (id) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE reaper_lease.expires_at < now()
                   OR reaper_lease.holder = EXCLUDED.holder
            "#,
        )
        .bind(holder)
        .bind(ttl_seconds as f64)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Sweep 1: workflow runs whose heartbeat is older than the grace
    /// period. The run terminalizes, its remaining instances expire, and
    /// the aggregation rule decides each parent task's fate.
    ///
    /// Boundary: a heartbeat aged exactly `grace` is not yet stale.
    pub async fn terminate_stale_workflow_runs(
        &self,
        grace: chrono::Duration,
    ) -> Result<Vec<ReapedRun>> {
        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        // Candidates first without locks, then workflow locks before run
        // locks: the same order the bind and resume paths use, so the worst
        // case under contention is a retryable lock timeout, not a deadlock.
        let candidates: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, workflow_id FROM workflow_run
            WHERE status NOT IN ('D', 'E', 'S', 'T', 'A')
              AND heartbeat_date < now() - make_interval(secs => $1)
            ORDER BY id
            "#,
        )
        .bind(grace.num_seconds() as f64)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        if candidates.is_empty() {
            tx.commit().await.map_err(map_db_err)?;
            return Ok(Vec::new());
        }

        let mut workflow_ids: Vec<i64> = candidates.iter().map(|(_, wf)| *wf).collect();
        workflow_ids.sort_unstable();
        workflow_ids.dedup();
        sqlx::query("SELECT id FROM workflow WHERE id = ANY($1) ORDER BY id FOR UPDATE")
            .bind(&workflow_ids)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

        let candidate_run_ids: Vec<i64> = candidates.iter().map(|(id, _)| *id).collect();
        let stale: Vec<(i64, i64, String)> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, status FROM workflow_run
            WHERE id = ANY($1)
              AND status NOT IN ('D', 'E', 'S', 'T', 'A')
              AND heartbeat_date < now() - make_interval(secs => $2)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(&candidate_run_ids)
        .bind(grace.num_seconds() as f64)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        if stale.is_empty() {
            tx.commit().await.map_err(map_db_err)?;
            return Ok(Vec::new());
        }

        let run_ids: Vec<i64> = stale.iter().map(|(id, _, _)| *id).collect();

        for (run_id, _, status) in &stale {
            let observed: WorkflowRunStatus = status.parse().map_err(JobmonError::schema)?;
            // Runs that never bound abort; everything else terminates cold.
            let target = if fsm::validate_workflow_run(observed, WorkflowRunStatus::Terminated)
                == Transition::Legal
            {
                WorkflowRunStatus::Terminated
            } else {
                WorkflowRunStatus::Aborted
            };
            sqlx::query(
                "UPDATE workflow_run SET status = $2, status_date = now() WHERE id = $1",
            )
            .bind(run_id)
            .bind(target.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        }

        // Task locks first, then the doomed instances.
        let tasks: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, node_id, array_id, task_args_hash, name,
                   command, status, status_date, num_attempts, max_attempts,
                   resource_scale, task_resources_id, created_at
            FROM task
            WHERE id IN (
                SELECT task_id FROM task_instance
                WHERE workflow_run_id = ANY($1)
                  AND status IN ('Q', 'I', 'B', 'O', 'R', 'K')
            )
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(&run_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let instances: Vec<(i64, i64, i64, String)> = sqlx::query_as(
            r#"
            SELECT id, task_id, workflow_run_id, status FROM task_instance
            WHERE workflow_run_id = ANY($1)
              AND status IN ('Q', 'I', 'B', 'O', 'R', 'K')
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(&run_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let kill_flagged: Vec<i64> = instances
            .iter()
            .filter(|(_, _, _, s)| s == "K")
            .map(|(id, _, _, _)| *id)
            .collect();
        let expiring: Vec<i64> = instances
            .iter()
            .filter(|(_, _, _, s)| s != "K")
            .map(|(id, _, _, _)| *id)
            .collect();

        if !kill_flagged.is_empty() {
            sqlx::query(
                "UPDATE task_instance SET status = 'F', status_date = now() WHERE id = ANY($1)",
            )
            .bind(&kill_flagged)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        }
        if !expiring.is_empty() {
            sqlx::query(
                "UPDATE task_instance SET status = 'X', status_date = now() WHERE id = ANY($1)",
            )
            .bind(&expiring)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

            sqlx::query(
                r#"
                INSERT INTO task_instance_error_log (task_instance_id, description)
                SELECT unnest($1::bigint[]),
                       'workflow run heartbeat expired; task instance reaped'
                "#,
            )
            .bind(&expiring)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        }

        // Aggregate each parent. A task whose instance was kill-flagged goes
        // fatal; everything else follows the no-heartbeat rule.
        let killed_tasks: std::collections::HashSet<i64> = instances
            .iter()
            .filter(|(_, _, _, s)| s == "K")
            .map(|(_, task_id, _, _)| *task_id)
            .collect();

        let mut audits: Vec<AuditEntry> = Vec::new();
        let mut to_status: HashMap<&'static str, Vec<i64>> = HashMap::new();
        for task in &tasks {
            let observed = task.task_status()?;
            let target = if killed_tasks.contains(&task.id) {
                Some(TaskStatus::ErrorFatal)
            } else {
                fsm::task_status_on_instance_end(
                    TaskInstanceStatus::NoHeartbeat,
                    task.retries_remaining(),
                )
            };
            let Some(target) = target else { continue };
            if fsm::validate_task(observed, target) != Transition::Legal {
                continue;
            }
            audits.push((
                task.id,
                observed.as_str().to_string(),
                target.as_str().to_string(),
            ));
            to_status.entry(target.as_str()).or_default().push(task.id);
        }

        append_task_audits(&mut tx, &audits).await?;
        for (status, ids) in &to_status {
            sqlx::query("UPDATE task SET status = $2, status_date = now() WHERE id = ANY($1)")
                .bind(ids)
                .bind(*status)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
        }

        // Mirror the terminations onto the owning workflows.
        for (_, workflow_id, _) in &stale {
            let wf: Option<(String,)> =
                sqlx::query_as("SELECT status FROM workflow WHERE id = $1 FOR UPDATE")
                    .bind(workflow_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(map_db_err)?;
            if let Some((current,)) = wf {
                let observed: WorkflowStatus = current.parse().map_err(JobmonError::schema)?;
                if fsm::validate_workflow(observed, WorkflowStatus::Failed) == Transition::Legal {
                    sqlx::query(
                        "UPDATE workflow SET status = 'F', status_date = now() WHERE id = $1",
                    )
                    .bind(workflow_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_db_err)?;
                }
            }
        }

        tx.commit().await.map_err(map_db_err)?;

        let per_run: HashMap<i64, u64> =
            instances
                .iter()
                .fold(HashMap::new(), |mut acc, (_, _, run_id, _)| {
                    *acc.entry(*run_id).or_default() += 1;
                    acc
                });
        let reaped: Vec<ReapedRun> = stale
            .iter()
            .map(|(run_id, workflow_id, _)| ReapedRun {
                workflow_run_id: *run_id,
                workflow_id: *workflow_id,
                instances_expired: per_run.get(run_id).copied().unwrap_or(0),
            })
            .collect();

        for run in &reaped {
            tracing::warn!(
                workflow_run_id = run.workflow_run_id,
                workflow_id = run.workflow_id,
                instances_expired = run.instances_expired,
                "Workflow run reaped for missed heartbeats"
            );
        }
        Ok(reaped)
    }

    /// Sweep 2: task instances whose own report-by deadline passed.
    pub async fn expire_lapsed_task_instances(&self) -> Result<u64> {
        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        let candidates: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM task_instance
            WHERE status IN ('B', 'O', 'R') AND report_by_date < now()
            ORDER BY id
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        if candidates.is_empty() {
            tx.commit().await.map_err(map_db_err)?;
            return Ok(0);
        }
        let candidate_ids: Vec<i64> = candidates.into_iter().map(|r| r.0).collect();

        let tasks: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, node_id, array_id, task_args_hash, name,
                   command, status, status_date, num_attempts, max_attempts,
                   resource_scale, task_resources_id, created_at
            FROM task
            WHERE id IN (SELECT task_id FROM task_instance WHERE id = ANY($1))
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(&candidate_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        // Re-check under the lock: a heartbeat may have landed since.
        let lapsed: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, task_id FROM task_instance
            WHERE id = ANY($1) AND status IN ('B', 'O', 'R') AND report_by_date < now()
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(&candidate_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        if lapsed.is_empty() {
            tx.commit().await.map_err(map_db_err)?;
            return Ok(0);
        }

        let lapsed_ids: Vec<i64> = lapsed.iter().map(|(id, _)| *id).collect();
        sqlx::query(
            "UPDATE task_instance SET status = 'X', status_date = now() WHERE id = ANY($1)",
        )
        .bind(&lapsed_ids)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;

        sqlx::query(
            r#"
            INSERT INTO task_instance_error_log (task_instance_id, description)
            SELECT unnest($1::bigint[]), 'missed heartbeat deadline; task instance reaped'
            "#,
        )
        .bind(&lapsed_ids)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let lapsed_tasks: std::collections::HashSet<i64> =
            lapsed.iter().map(|(_, task_id)| *task_id).collect();

        let mut audits: Vec<AuditEntry> = Vec::new();
        let mut to_status: HashMap<&'static str, Vec<i64>> = HashMap::new();
        for task in tasks.iter().filter(|t| lapsed_tasks.contains(&t.id)) {
            let observed = task.task_status()?;
            let Some(target) = fsm::task_status_on_instance_end(
                TaskInstanceStatus::NoHeartbeat,
                task.retries_remaining(),
            ) else {
                continue;
            };
            if fsm::validate_task(observed, target) != Transition::Legal {
                continue;
            }
            audits.push((
                task.id,
                observed.as_str().to_string(),
                target.as_str().to_string(),
            ));
            to_status.entry(target.as_str()).or_default().push(task.id);
        }

        append_task_audits(&mut tx, &audits).await?;
        for (status, ids) in &to_status {
            sqlx::query("UPDATE task SET status = $2, status_date = now() WHERE id = ANY($1)")
                .bind(ids)
                .bind(*status)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
        }

        tx.commit().await.map_err(map_db_err)?;

        tracing::warn!(
            expired = lapsed_ids.len(),
            "Task instances reaped for missed heartbeats"
        );
        Ok(lapsed_ids.len() as u64)
    }
}
