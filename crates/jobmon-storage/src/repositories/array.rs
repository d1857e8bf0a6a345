// Arrays: the unit of batched dispatch.
//
// The three bulk transitions here (queue, launch, kill) are the only paths
// that move whole batches of tasks at once. Locking discipline: array row,
// then task rows, then instance rows, ids ascending.

use jobmon_core::states::TaskStatus;
use jobmon_core::{JobmonError, Result};

use crate::db::{map_db_err, Database};
use crate::models::*;
use crate::repositories::{append_task_audits, AuditEntry};

/// Result of queueing one batch.
#[derive(Debug, Clone)]
pub struct QueuedBatch {
    pub array_id: i64,
    pub batch_number: i32,
    pub task_instance_ids: Vec<i64>,
}

impl Database {
    pub async fn get_or_create_array(
        &self,
        workflow_id: i64,
        task_template_version_id: i64,
        name: &str,
        max_concurrently_running: i32,
    ) -> Result<ArrayRow> {
        let row = sqlx::query_as::<_, ArrayRow>(
            r#"
            INSERT INTO task_array
                (workflow_id, task_template_version_id, name, max_concurrently_running)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workflow_id, task_template_version_id)
                DO UPDATE SET max_concurrently_running = EXCLUDED.max_concurrently_running
            RETURNING id, workflow_id, task_template_version_id, name,
                      max_concurrently_running, batch_number, created_at
            "#,
        )
        .bind(workflow_id)
        .bind(task_template_version_id)
        .bind(name)
        .bind(max_concurrently_running)
        .fetch_one(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    pub async fn get_array(&self, id: i64) -> Result<Option<ArrayRow>> {
        let row = sqlx::query_as::<_, ArrayRow>(
            r#"
            SELECT id, workflow_id, task_template_version_id, name,
                   max_concurrently_running, batch_number, created_at
            FROM task_array WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    /// Bulk transition 1: atomically queue a batch of tasks and create one
    /// task instance per task.
    ///
    /// Only tasks observed in G or A under the row lock make the batch;
    /// anything else (a concurrent queue already claimed it, a kill landed
    /// first) is silently skipped, which is what makes concurrent queue
    /// attempts on overlapping sets safe: each task gains exactly one G->Q
    /// audit entry.
    pub async fn queue_task_batch(
        &self,
        array_id: i64,
        task_ids: &[i64],
        task_resources_id: Option<i64>,
        workflow_run_id: i64,
    ) -> Result<QueuedBatch> {
        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        // The array row lock serializes batch numbering.
        let batch_number: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE task_array SET batch_number = batch_number + 1
            WHERE id = $1
            RETURNING batch_number
            "#,
        )
        .bind(array_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_err)?;
        let batch_number = batch_number
            .ok_or_else(|| JobmonError::not_found(format!("array {} does not exist", array_id)))?
            .0;

        let observed: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, status FROM task
            WHERE id = ANY($1) AND array_id = $2
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(task_ids)
        .bind(array_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let eligible: Vec<(i64, String)> = observed
            .into_iter()
            .filter(|(_, status)| status == "G" || status == "A")
            .collect();

        let audits: Vec<AuditEntry> = eligible
            .iter()
            .map(|(id, status)| (*id, status.clone(), TaskStatus::Queued.as_str().to_string()))
            .collect();
        append_task_audits(&mut tx, &audits).await?;

        let eligible_ids: Vec<i64> = eligible.iter().map(|(id, _)| *id).collect();
        let mut instance_ids = Vec::new();

        if !eligible_ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE task
                SET status = 'Q', num_attempts = num_attempts + 1,
                    status_date = now(), task_resources_id = COALESCE($2, task_resources_id)
                WHERE id = ANY($1)
                "#,
            )
            .bind(&eligible_ids)
            .bind(task_resources_id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

            let created: Vec<(i64,)> = sqlx::query_as(
                r#"
                INSERT INTO task_instance
                    (task_id, workflow_run_id, array_id, array_batch_num, task_resources_id)
                SELECT t.id, $2, $3, $4, COALESCE($5, t.task_resources_id)
                FROM task t WHERE t.id = ANY($1)
                ORDER BY t.id
                RETURNING id
                "#,
            )
            .bind(&eligible_ids)
            .bind(workflow_run_id)
            .bind(array_id)
            .bind(batch_number)
            .bind(task_resources_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_db_err)?;

            instance_ids = created.into_iter().map(|r| r.0).collect();
        }

        tx.commit().await.map_err(map_db_err)?;

        tracing::info!(
            array_id,
            batch_number,
            queued = instance_ids.len(),
            requested = task_ids.len(),
            "Task batch queued"
        );

        Ok(QueuedBatch {
            array_id,
            batch_number,
            task_instance_ids: instance_ids,
        })
    }

    /// Bulk transition 2: move a submitted batch to Launched. Tasks still in
    /// I go to O; their instances pick up the heartbeat deadline.
    pub async fn transition_to_launched(
        &self,
        array_id: i64,
        batch_number: i32,
        next_report_increment_seconds: i64,
    ) -> Result<u64> {
        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        let tasks: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT t.id, t.status FROM task t
            WHERE t.status = 'I' AND t.id IN (
                SELECT task_id FROM task_instance
                WHERE array_id = $1 AND array_batch_num = $2
            )
            ORDER BY t.id
            FOR UPDATE
            "#,
        )
        .bind(array_id)
        .bind(batch_number)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let audits: Vec<AuditEntry> = tasks
            .iter()
            .map(|(id, status)| (*id, status.clone(), "O".to_string()))
            .collect();
        append_task_audits(&mut tx, &audits).await?;

        let task_ids: Vec<i64> = tasks.iter().map(|(id, _)| *id).collect();
        if !task_ids.is_empty() {
            sqlx::query("UPDATE task SET status = 'O', status_date = now() WHERE id = ANY($1)")
                .bind(&task_ids)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
        }

        let launched = sqlx::query(
            r#"
            UPDATE task_instance
            SET status = 'O', status_date = now(),
                report_by_date = now() + make_interval(secs => $3)
            WHERE array_id = $1 AND array_batch_num = $2 AND status IN ('I', 'B')
            "#,
        )
        .bind(array_id)
        .bind(batch_number)
        .bind(next_report_increment_seconds as f64)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?
        .rows_affected();

        tx.commit().await.map_err(map_db_err)?;

        tracing::info!(array_id, batch_number, launched, "Batch transitioned to launched");
        Ok(launched)
    }

    /// Bulk transition 3: confirm a kill. Task phase first, instance phase
    /// second, so no parent is left live after its instances terminalize.
    pub async fn transition_to_killed(&self, array_id: i64, batch_number: i32) -> Result<u64> {
        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        // 'I' is included for batches killed between instantiation and
        // launch: their instances were flagged K before submission.
        let tasks: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT t.id, t.status FROM task t
            WHERE t.status IN ('I', 'O', 'R') AND t.id IN (
                SELECT task_id FROM task_instance
                WHERE array_id = $1 AND array_batch_num = $2 AND status = 'K'
            )
            ORDER BY t.id
            FOR UPDATE
            "#,
        )
        .bind(array_id)
        .bind(batch_number)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let audits: Vec<AuditEntry> = tasks
            .iter()
            .map(|(id, status)| (*id, status.clone(), "F".to_string()))
            .collect();
        append_task_audits(&mut tx, &audits).await?;

        let task_ids: Vec<i64> = tasks.iter().map(|(id, _)| *id).collect();
        if !task_ids.is_empty() {
            sqlx::query("UPDATE task SET status = 'F', status_date = now() WHERE id = ANY($1)")
                .bind(&task_ids)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
        }

        let confirmed = sqlx::query(
            r#"
            UPDATE task_instance SET status = 'F', status_date = now()
            WHERE array_id = $1 AND array_batch_num = $2 AND status = 'K'
            "#,
        )
        .bind(array_id)
        .bind(batch_number)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?
        .rows_affected();

        tx.commit().await.map_err(map_db_err)?;

        tracing::info!(array_id, batch_number, confirmed, "Batch transitioned to killed");
        Ok(confirmed)
    }
}
