// Workflow lifecycle: bind, concurrency caps, resume, stop.
//
// The resume protocol here is the only code path that regresses a task out
// of a terminal state.

use jobmon_core::states::{TaskStatus, WorkflowRunStatus, WorkflowStatus};
use jobmon_core::{fsm, JobmonError, Result, Transition};

use crate::db::{map_db_err, Database};
use crate::models::*;
use crate::repositories::{append_task_audits, AuditEntry};

/// Result of a resume request.
#[derive(Debug, Clone)]
pub struct ResumeOutcome {
    pub workflow_id: i64,
    pub tasks_reset: u64,
    pub runs_terminated: u64,
}

/// Result of a stop request.
#[derive(Debug, Clone)]
pub struct StopOutcome {
    pub tasks_halted: u64,
    pub instances_killed: u64,
}

impl Database {
    // ============================================
    // Workflows
    // ============================================

    /// Create a workflow, or return the existing row when the identity hash
    /// already exists (invariant: unique by tool version + dag + args).
    pub async fn create_workflow(&self, input: CreateWorkflow) -> Result<WorkflowRow> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            INSERT INTO workflow
                (tool_version_id, dag_id, workflow_args_hash, name, user_name,
                 max_concurrently_running)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tool_version_id, dag_id, workflow_args_hash)
                DO UPDATE SET workflow_args_hash = EXCLUDED.workflow_args_hash
            RETURNING id, tool_version_id, dag_id, workflow_args_hash, name,
                      user_name, status, status_date, max_concurrently_running,
                      created_at
            "#,
        )
        .bind(input.tool_version_id)
        .bind(input.dag_id)
        .bind(&input.workflow_args_hash)
        .bind(&input.name)
        .bind(&input.user_name)
        .bind(input.max_concurrently_running)
        .fetch_one(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    pub async fn get_workflow(&self, id: i64) -> Result<Option<WorkflowRow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, tool_version_id, dag_id, workflow_args_hash, name,
                   user_name, status, status_date, max_concurrently_running,
                   created_at
            FROM workflow
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    pub async fn update_max_concurrently_running(
        &self,
        workflow_id: i64,
        max_tasks: i32,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE workflow SET max_concurrently_running = $2 WHERE id = $1",
        )
        .bind(workflow_id)
        .bind(max_tasks)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?;

        if result.rows_affected() == 0 {
            return Err(JobmonError::not_found(format!(
                "workflow {} does not exist",
                workflow_id
            )));
        }
        Ok(())
    }

    pub async fn update_array_max_concurrently_running(
        &self,
        workflow_id: i64,
        task_template_version_id: i64,
        max_tasks: i32,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE task_array SET max_concurrently_running = $3
            WHERE workflow_id = $1 AND task_template_version_id = $2
            "#,
        )
        .bind(workflow_id)
        .bind(task_template_version_id)
        .bind(max_tasks)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?;

        if result.rows_affected() == 0 {
            return Err(JobmonError::not_found(format!(
                "no array for workflow {} and template version {}",
                workflow_id, task_template_version_id
            )));
        }
        Ok(())
    }

    pub async fn get_max_concurrently_running(&self, workflow_id: i64) -> Result<Option<i32>> {
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT max_concurrently_running FROM workflow WHERE id = $1",
        )
        .bind(workflow_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row.map(|r| r.0))
    }

    // ============================================
    // Resume
    // ============================================

    /// The resume protocol, as one atomic sequence:
    /// 1. the workflow must be resumable: every live run carries a cold- or
    ///    hot-resume flag (those runs are terminated here);
    /// 2. every task not in D or G is reset to G with zero attempts, each
    ///    reset audited;
    /// 3. tasks in R survive unless `reset_if_running`.
    /// Done tasks keep their outputs untouched.
    pub async fn set_resume_state(
        &self,
        workflow_id: i64,
        reset_if_running: bool,
    ) -> Result<ResumeOutcome> {
        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        let workflow = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, tool_version_id, dag_id, workflow_args_hash, name,
                   user_name, status, status_date, max_concurrently_running,
                   created_at
            FROM workflow WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| JobmonError::not_found(format!("workflow {} does not exist", workflow_id)))?;

        // A live run blocks resume unless it already asked for one.
        let live_runs: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, status FROM workflow_run
            WHERE workflow_id = $1 AND status NOT IN ('D', 'E', 'S', 'T', 'A')
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let mut runs_terminated = 0u64;
        for (run_id, status) in &live_runs {
            let observed: WorkflowRunStatus = status.parse().map_err(JobmonError::schema)?;
            if !matches!(
                observed,
                WorkflowRunStatus::ColdResume | WorkflowRunStatus::HotResume
            ) {
                return Err(JobmonError::conflict(format!(
                    "workflow {} has live run {} in state {}; signal resume on it first",
                    workflow_id, run_id, status
                )));
            }
            sqlx::query(
                "UPDATE workflow_run SET status = 'T', status_date = now() WHERE id = $1",
            )
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
            runs_terminated += 1;
        }

        // The reset set: everything not Done and not already fresh.
        let mut excluded = vec!["D".to_string(), "G".to_string()];
        if !reset_if_running {
            excluded.push("R".to_string());
        }
        let reset_rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, status FROM task
            WHERE workflow_id = $1 AND status <> ALL($2)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .bind(&excluded)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let audits: Vec<AuditEntry> = reset_rows
            .iter()
            .map(|(id, status)| (*id, status.clone(), TaskStatus::Registering.as_str().to_string()))
            .collect();
        append_task_audits(&mut tx, &audits).await?;

        let reset_ids: Vec<i64> = reset_rows.iter().map(|(id, _)| *id).collect();
        if !reset_ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE task
                SET status = 'G', num_attempts = 0, status_date = now()
                WHERE id = ANY($1)
                "#,
            )
            .bind(&reset_ids)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        }

        // The workflow itself regresses to Registering so a new run can bind.
        if workflow.workflow_status()? != WorkflowStatus::Registering {
            sqlx::query("UPDATE workflow SET status = 'G', status_date = now() WHERE id = $1")
                .bind(workflow_id)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
        }

        tx.commit().await.map_err(map_db_err)?;

        tracing::info!(
            workflow_id,
            tasks_reset = reset_ids.len(),
            runs_terminated,
            "Workflow reset for resume"
        );

        Ok(ResumeOutcome {
            workflow_id,
            tasks_reset: reset_ids.len() as u64,
            runs_terminated,
        })
    }

    // ============================================
    // Stop
    // ============================================

    /// Halt undispatched tasks, mark in-flight instances for kill, and stop
    /// the live run. The distributor's kill sweep finishes the job for
    /// anything already on the cluster.
    pub async fn stop_workflow(&self, workflow_id: i64) -> Result<StopOutcome> {
        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        let workflow = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, tool_version_id, dag_id, workflow_args_hash, name,
                   user_name, status, status_date, max_concurrently_running,
                   created_at
            FROM workflow WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| JobmonError::not_found(format!("workflow {} does not exist", workflow_id)))?;

        // Tasks that never reached the cluster halt in place.
        let halt_rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, status FROM task
            WHERE workflow_id = $1 AND status IN ('G', 'Q', 'A')
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let audits: Vec<AuditEntry> = halt_rows
            .iter()
            .map(|(id, status)| (*id, status.clone(), "H".to_string()))
            .collect();
        append_task_audits(&mut tx, &audits).await?;

        let halt_ids: Vec<i64> = halt_rows.iter().map(|(id, _)| *id).collect();
        if !halt_ids.is_empty() {
            sqlx::query("UPDATE task SET status = 'H', status_date = now() WHERE id = ANY($1)")
                .bind(&halt_ids)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
        }

        // Everything in flight is asked to kill itself.
        let killed = sqlx::query(
            r#"
            UPDATE task_instance SET status = 'K', status_date = now()
            WHERE task_id IN (SELECT id FROM task WHERE workflow_id = $1)
              AND status IN ('Q', 'I', 'B', 'O', 'R')
            "#,
        )
        .bind(workflow_id)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?
        .rows_affected();

        // Live runs stop; resume-flagged runs keep their flag until the
        // resume protocol terminates them.
        let live_runs: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, status FROM workflow_run
            WHERE workflow_id = $1 AND status NOT IN ('D', 'E', 'S', 'T', 'A')
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        for (run_id, status) in &live_runs {
            let observed: WorkflowRunStatus = status.parse().map_err(JobmonError::schema)?;
            if fsm::validate_workflow_run(observed, WorkflowRunStatus::Stopped)
                == Transition::Legal
            {
                sqlx::query(
                    "UPDATE workflow_run SET status = 'S', status_date = now() WHERE id = $1",
                )
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
            }
        }

        let observed_wf = workflow.workflow_status()?;
        if fsm::validate_workflow(observed_wf, WorkflowStatus::Halted) == Transition::Legal {
            sqlx::query("UPDATE workflow SET status = 'H', status_date = now() WHERE id = $1")
                .bind(workflow_id)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
        }

        tx.commit().await.map_err(map_db_err)?;

        tracing::info!(
            workflow_id,
            tasks_halted = halt_ids.len(),
            instances_killed = killed,
            "Workflow stopped"
        );

        Ok(StopOutcome {
            tasks_halted: halt_ids.len() as u64,
            instances_killed: killed,
        })
    }
}
