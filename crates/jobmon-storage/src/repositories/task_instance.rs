// Task instance lifecycle: the log_* family reported by the distributor and
// by workers on cluster nodes.
//
// Aggregation discipline (the one that matters): the parent task's row lock
// is taken BEFORE the instance's status is written. Without it, interleaved
// writers can leave a task Running while its only instance is already
// terminal.

use jobmon_core::states::{TaskInstanceStatus, TaskStatus};
use jobmon_core::{fsm, JobmonError, Result, Transition};

use crate::db::{map_db_err, Database};
use crate::models::*;
use crate::repositories::append_task_audits;

const INSTANCE_COLUMNS: &str = r#"
    id, task_id, workflow_run_id, array_id, array_batch_num, task_resources_id,
    status, status_date, distributor_id, nodename, stdout_log, stderr_log,
    report_by_date, wallclock_seconds, maxrss_bytes, created_at
"#;

/// Usage figures a worker reports at exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageReport {
    pub wallclock_seconds: Option<f64>,
    pub maxrss_bytes: Option<i64>,
}

impl Database {
    pub async fn get_task_instance(&self, id: i64) -> Result<Option<TaskInstanceRow>> {
        let row = sqlx::query_as::<_, TaskInstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instance WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    pub async fn get_task_instance_error_logs(
        &self,
        task_instance_id: i64,
    ) -> Result<Vec<TaskInstanceErrorLogRow>> {
        let rows = sqlx::query_as::<_, TaskInstanceErrorLogRow>(
            r#"
            SELECT id, task_instance_id, description, error_time
            FROM task_instance_error_log
            WHERE task_instance_id = $1
            ORDER BY id
            "#,
        )
        .bind(task_instance_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    /// Claim a batch of queued instances for dispatch: parent tasks move
    /// Q -> I, instances follow. Instances whose parent was already claimed
    /// by a concurrent call are skipped; the returned ids are the ones this
    /// call owns.
    pub async fn instantiate_task_instances(&self, instance_ids: &[i64]) -> Result<Vec<i64>> {
        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        let tasks: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, status FROM task
            WHERE id IN (SELECT task_id FROM task_instance WHERE id = ANY($1))
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(instance_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let instances: Vec<(i64, i64, String)> = sqlx::query_as(
            r#"
            SELECT id, task_id, status FROM task_instance
            WHERE id = ANY($1)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(instance_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let queued_tasks: std::collections::HashSet<i64> = tasks
            .iter()
            .filter(|(_, status)| status == "Q")
            .map(|(id, _)| *id)
            .collect();

        let claimed: Vec<i64> = instances
            .iter()
            .filter(|(_, task_id, status)| status == "Q" && queued_tasks.contains(task_id))
            .map(|(id, _, _)| *id)
            .collect();
        let claimed_tasks: Vec<i64> = instances
            .iter()
            .filter(|(id, _, _)| claimed.contains(id))
            .map(|(_, task_id, _)| *task_id)
            .collect();

        let audits: Vec<(i64, String, String)> = claimed_tasks
            .iter()
            .map(|id| (*id, "Q".to_string(), "I".to_string()))
            .collect();
        append_task_audits(&mut tx, &audits).await?;

        if !claimed.is_empty() {
            sqlx::query("UPDATE task SET status = 'I', status_date = now() WHERE id = ANY($1)")
                .bind(&claimed_tasks)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;

            sqlx::query(
                "UPDATE task_instance SET status = 'I', status_date = now() WHERE id = ANY($1)",
            )
            .bind(&claimed)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        }

        tx.commit().await.map_err(map_db_err)?;

        tracing::debug!(
            requested = instance_ids.len(),
            claimed = claimed.len(),
            "Task instances instantiated"
        );
        Ok(claimed)
    }

    /// The cluster accepted the submission: record the distributor id and
    /// start the heartbeat clock.
    pub async fn log_distributor_id(
        &self,
        instance_id: i64,
        distributor_id: &str,
        next_report_increment_seconds: i64,
    ) -> Result<TaskInstanceRow> {
        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        let instance = self.lock_instance(&mut tx, instance_id).await?;
        let observed = instance.instance_status()?;
        let transition = fsm::validate_task_instance(observed, TaskInstanceStatus::BatchSubmitted)
            .into_result("task_instance", instance_id, observed.as_str(), "B")?;
        if transition == Transition::Idempotent {
            tx.commit().await.map_err(map_db_err)?;
            return Ok(instance);
        }

        let updated = sqlx::query_as::<_, TaskInstanceRow>(&format!(
            r#"
            UPDATE task_instance
            SET status = 'B', status_date = now(), distributor_id = $2,
                report_by_date = now() + make_interval(secs => $3)
            WHERE id = $1
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(instance_id)
        .bind(distributor_id)
        .bind(next_report_increment_seconds as f64)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_err)?;

        tx.commit().await.map_err(map_db_err)?;
        Ok(updated)
    }

    /// Submission never produced a distributor id; counts as a recoverable
    /// error against the parent task.
    pub async fn log_no_distributor_id(
        &self,
        instance_id: i64,
        description: &str,
    ) -> Result<TaskInstanceRow> {
        self.log_instance_error(
            instance_id,
            TaskInstanceStatus::NoDistributorId,
            description,
            None,
            UsageReport::default(),
        )
        .await
    }

    /// Worker reports startup: the instance (and its task, if first) go
    /// Running and the heartbeat deadline is set.
    pub async fn log_running(
        &self,
        instance_id: i64,
        nodename: &str,
        next_report_increment_seconds: i64,
    ) -> Result<TaskInstanceRow> {
        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        let task_id = self.instance_task_id(&mut tx, instance_id).await?;
        let task = self.lock_task(&mut tx, task_id).await?;
        let instance = self.lock_instance(&mut tx, instance_id).await?;

        let observed = instance.instance_status()?;
        let transition = fsm::validate_task_instance(observed, TaskInstanceStatus::Running)
            .into_result("task_instance", instance_id, observed.as_str(), "R")?;
        if transition == Transition::Idempotent {
            tx.commit().await.map_err(map_db_err)?;
            return Ok(instance);
        }

        let updated = sqlx::query_as::<_, TaskInstanceRow>(&format!(
            r#"
            UPDATE task_instance
            SET status = 'R', status_date = now(), nodename = $2,
                report_by_date = now() + make_interval(secs => $3)
            WHERE id = $1
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(instance_id)
        .bind(nodename)
        .bind(next_report_increment_seconds as f64)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_err)?;

        self.transition_task_in_tx(&mut tx, &task, TaskStatus::Running)
            .await?;

        tx.commit().await.map_err(map_db_err)?;
        Ok(updated)
    }

    /// Worker heartbeat: push the report-by deadline forward. Returns the
    /// row so the worker can observe a pending kill request.
    pub async fn log_task_instance_heartbeat(
        &self,
        instance_id: i64,
        next_report_increment_seconds: i64,
    ) -> Result<TaskInstanceRow> {
        let row = sqlx::query_as::<_, TaskInstanceRow>(&format!(
            r#"
            UPDATE task_instance
            SET report_by_date = now() + make_interval(secs => $2)
            WHERE id = $1 AND status IN ('B', 'O', 'R')
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(instance_id)
        .bind(next_report_increment_seconds as f64)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        match row {
            Some(instance) => Ok(instance),
            None => {
                let existing = self.get_task_instance(instance_id).await?.ok_or_else(|| {
                    JobmonError::not_found(format!(
                        "task instance {} does not exist",
                        instance_id
                    ))
                })?;
                Err(JobmonError::InvalidTransition {
                    entity: "task_instance",
                    id: instance_id,
                    from: existing.status,
                    to: "heartbeat".to_string(),
                })
            }
        }
    }

    /// Worker reports success. Idempotent repeats return success without a
    /// second write.
    pub async fn log_done(
        &self,
        instance_id: i64,
        usage: UsageReport,
        stdout_tail: Option<&str>,
    ) -> Result<TaskInstanceRow> {
        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        let task_id = self.instance_task_id(&mut tx, instance_id).await?;
        let task = self.lock_task(&mut tx, task_id).await?;
        let instance = self.lock_instance(&mut tx, instance_id).await?;

        let observed = instance.instance_status()?;
        let transition = fsm::validate_task_instance(observed, TaskInstanceStatus::Done)
            .into_result("task_instance", instance_id, observed.as_str(), "D")?;
        if transition == Transition::Idempotent {
            tx.commit().await.map_err(map_db_err)?;
            return Ok(instance);
        }

        let updated = sqlx::query_as::<_, TaskInstanceRow>(&format!(
            r#"
            UPDATE task_instance
            SET status = 'D', status_date = now(),
                wallclock_seconds = COALESCE($2, wallclock_seconds),
                maxrss_bytes = COALESCE($3, maxrss_bytes),
                stdout_log = COALESCE($4, stdout_log)
            WHERE id = $1
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(instance_id)
        .bind(usage.wallclock_seconds)
        .bind(usage.maxrss_bytes)
        .bind(stdout_tail)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_err)?;

        self.transition_task_in_tx(&mut tx, &task, TaskStatus::Done)
            .await?;

        tx.commit().await.map_err(map_db_err)?;
        Ok(updated)
    }

    /// Worker reports a known error.
    pub async fn log_known_error(
        &self,
        instance_id: i64,
        description: &str,
        stderr_tail: Option<&str>,
        usage: UsageReport,
    ) -> Result<TaskInstanceRow> {
        self.log_instance_error(
            instance_id,
            TaskInstanceStatus::Error,
            description,
            stderr_tail,
            usage,
        )
        .await
    }

    /// Worker wrapper caught something it cannot classify.
    pub async fn log_unknown_error(
        &self,
        instance_id: i64,
        description: &str,
        stderr_tail: Option<&str>,
        usage: UsageReport,
    ) -> Result<TaskInstanceRow> {
        self.log_instance_error(
            instance_id,
            TaskInstanceStatus::UnknownError,
            description,
            stderr_tail,
            usage,
        )
        .await
    }

    /// Error reported from the worker node itself (setup failure, lost
    /// command, bad environment).
    pub async fn log_error_worker_node(
        &self,
        instance_id: i64,
        description: &str,
        stderr_tail: Option<&str>,
    ) -> Result<TaskInstanceRow> {
        self.log_instance_error(
            instance_id,
            TaskInstanceStatus::Error,
            description,
            stderr_tail,
            UsageReport::default(),
        )
        .await
    }

    /// The distributor's poll saw the cluster kill this instance for
    /// resource exhaustion.
    pub async fn log_resource_error(
        &self,
        instance_id: i64,
        description: &str,
    ) -> Result<TaskInstanceRow> {
        self.log_instance_error(
            instance_id,
            TaskInstanceStatus::ResourceError,
            description,
            None,
            UsageReport::default(),
        )
        .await
    }

    /// Kill batches pending for a workflow run, grouped for the plugin.
    pub async fn get_kill_batches(&self, workflow_run_id: i64) -> Result<Vec<KillBatchRow>> {
        let rows = sqlx::query_as::<_, KillBatchRow>(
            r#"
            SELECT array_id, array_batch_num,
                   COALESCE(
                       array_agg(distributor_id) FILTER (WHERE distributor_id IS NOT NULL),
                       '{}'
                   ) AS distributor_ids
            FROM task_instance
            WHERE workflow_run_id = $1 AND status = 'K'
            GROUP BY array_id, array_batch_num
            ORDER BY array_id, array_batch_num
            "#,
        )
        .bind(workflow_run_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    // ============================================
    // Shared locked paths
    // ============================================

    async fn instance_task_id(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        instance_id: i64,
    ) -> Result<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT task_id FROM task_instance WHERE id = $1")
                .bind(instance_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(map_db_err)?;
        row.map(|r| r.0).ok_or_else(|| {
            JobmonError::not_found(format!("task instance {} does not exist", instance_id))
        })
    }

    async fn lock_task(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        task_id: i64,
    ) -> Result<TaskRow> {
        sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, workflow_id, node_id, array_id, task_args_hash, name,
                   command, status, status_date, num_attempts, max_attempts,
                   resource_scale, task_resources_id, created_at
            FROM task WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| JobmonError::not_found(format!("task {} does not exist", task_id)))
    }

    async fn lock_instance(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        instance_id: i64,
    ) -> Result<TaskInstanceRow> {
        sqlx::query_as::<_, TaskInstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instance WHERE id = $1 FOR UPDATE"
        ))
        .bind(instance_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| {
            JobmonError::not_found(format!("task instance {} does not exist", instance_id))
        })
    }

    /// Apply a task transition inside an open transaction, with audit.
    /// Idempotent repeats are skipped; illegal requests abort the caller's
    /// transaction.
    pub(crate) async fn transition_task_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        task: &TaskRow,
        requested: TaskStatus,
    ) -> Result<()> {
        let observed = task.task_status()?;
        match fsm::validate_task(observed, requested).into_result(
            "task",
            task.id,
            observed.as_str(),
            requested.as_str(),
        )? {
            Transition::Idempotent => return Ok(()),
            _ => {}
        }

        append_task_audits(
            tx,
            &[(
                task.id,
                observed.as_str().to_string(),
                requested.as_str().to_string(),
            )],
        )
        .await?;

        sqlx::query("UPDATE task SET status = $2, status_date = now() WHERE id = $1")
            .bind(task.id)
            .bind(requested.as_str())
            .execute(&mut **tx)
            .await
            .map_err(map_db_err)?;

        Ok(())
    }

    /// One locked path for every instance error kind: parent task lock,
    /// instance lock, instance write, error log append, then the
    /// aggregation rule against the parent.
    async fn log_instance_error(
        &self,
        instance_id: i64,
        target: TaskInstanceStatus,
        description: &str,
        stderr_tail: Option<&str>,
        usage: UsageReport,
    ) -> Result<TaskInstanceRow> {
        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        let task_id = self.instance_task_id(&mut tx, instance_id).await?;
        let task = self.lock_task(&mut tx, task_id).await?;
        let instance = self.lock_instance(&mut tx, instance_id).await?;

        let observed = instance.instance_status()?;
        let transition = fsm::validate_task_instance(observed, target).into_result(
            "task_instance",
            instance_id,
            observed.as_str(),
            target.as_str(),
        )?;
        if transition == Transition::Idempotent {
            tx.commit().await.map_err(map_db_err)?;
            return Ok(instance);
        }

        let updated = sqlx::query_as::<_, TaskInstanceRow>(&format!(
            r#"
            UPDATE task_instance
            SET status = $2, status_date = now(),
                stderr_log = COALESCE($3, stderr_log),
                wallclock_seconds = COALESCE($4, wallclock_seconds),
                maxrss_bytes = COALESCE($5, maxrss_bytes)
            WHERE id = $1
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(instance_id)
        .bind(target.as_str())
        .bind(stderr_tail)
        .bind(usage.wallclock_seconds)
        .bind(usage.maxrss_bytes)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_err)?;

        sqlx::query(
            "INSERT INTO task_instance_error_log (task_instance_id, description) VALUES ($1, $2)",
        )
        .bind(instance_id)
        .bind(description)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;

        if let Some(task_target) =
            fsm::task_status_on_instance_end(target, task.retries_remaining())
        {
            self.transition_task_in_tx(&mut tx, &task, task_target).await?;
        }

        tx.commit().await.map_err(map_db_err)?;

        tracing::info!(
            task_instance_id = instance_id,
            task_id = task.id,
            kind = %target,
            "Task instance error recorded"
        );
        Ok(updated)
    }
}
