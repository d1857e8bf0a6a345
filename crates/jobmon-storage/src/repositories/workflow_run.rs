// Workflow runs: one attempt to execute a workflow.
//
// Invariant: at most one run per workflow is live. Creation takes the
// workflow row lock and refuses while another run holds it; the resume
// protocol is the hand-over mechanism.

use jobmon_core::states::{WorkflowRunStatus, WorkflowStatus};
use jobmon_core::{fsm, JobmonError, Result, Transition};

use crate::db::{map_db_err, Database};
use crate::models::*;

impl Database {
    pub async fn create_workflow_run(
        &self,
        workflow_id: i64,
        user_name: &str,
    ) -> Result<WorkflowRunRow> {
        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        let exists: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM workflow WHERE id = $1 FOR UPDATE")
                .bind(workflow_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_db_err)?;
        if exists.is_none() {
            return Err(JobmonError::not_found(format!(
                "workflow {} does not exist",
                workflow_id
            )));
        }

        let live: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, status FROM workflow_run
            WHERE workflow_id = $1 AND status NOT IN ('D', 'E', 'S', 'T', 'A')
            ORDER BY id
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_err)?;

        if let Some((run_id, status)) = live {
            return Err(JobmonError::conflict(format!(
                "workflow {} already has live run {} in state {}",
                workflow_id, run_id, status
            )));
        }

        let row = sqlx::query_as::<_, WorkflowRunRow>(
            r#"
            INSERT INTO workflow_run (workflow_id, user_name)
            VALUES ($1, $2)
            RETURNING id, workflow_id, user_name, status, status_date,
                      heartbeat_date, created_at
            "#,
        )
        .bind(workflow_id)
        .bind(user_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_err)?;

        tx.commit().await.map_err(map_db_err)?;

        tracing::info!(workflow_id, workflow_run_id = row.id, "Workflow run created");
        Ok(row)
    }

    pub async fn get_workflow_run(&self, id: i64) -> Result<Option<WorkflowRunRow>> {
        let row = sqlx::query_as::<_, WorkflowRunRow>(
            r#"
            SELECT id, workflow_id, user_name, status, status_date,
                   heartbeat_date, created_at
            FROM workflow_run
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    /// Apply a run transition and mirror the progress onto the workflow in
    /// the same transaction. Idempotent repeats are absorbed.
    pub async fn transition_workflow_run(
        &self,
        run_id: i64,
        requested: WorkflowRunStatus,
    ) -> Result<WorkflowRunRow> {
        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        let run = sqlx::query_as::<_, WorkflowRunRow>(
            r#"
            SELECT id, workflow_id, user_name, status, status_date,
                   heartbeat_date, created_at
            FROM workflow_run WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| JobmonError::not_found(format!("workflow run {} does not exist", run_id)))?;

        let observed = run.run_status()?;
        match fsm::validate_workflow_run(observed, requested).into_result(
            "workflow_run",
            run_id,
            observed.as_str(),
            requested.as_str(),
        )? {
            Transition::Idempotent => {
                tx.commit().await.map_err(map_db_err)?;
                return Ok(run);
            }
            _ => {}
        }

        let updated = sqlx::query_as::<_, WorkflowRunRow>(
            r#"
            UPDATE workflow_run SET status = $2, status_date = now()
            WHERE id = $1
            RETURNING id, workflow_id, user_name, status, status_date,
                      heartbeat_date, created_at
            "#,
        )
        .bind(run_id)
        .bind(requested.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_err)?;

        // Shadow the run's progress on the workflow. A stale mirror write is
        // skipped rather than allowed to override a later state.
        if let Some(wf_status) = workflow_status_for_run(requested) {
            let wf: Option<(String,)> =
                sqlx::query_as("SELECT status FROM workflow WHERE id = $1 FOR UPDATE")
                    .bind(run.workflow_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(map_db_err)?;
            if let Some((current,)) = wf {
                let observed_wf: WorkflowStatus = current.parse().map_err(JobmonError::schema)?;
                if fsm::validate_workflow(observed_wf, wf_status) == Transition::Legal {
                    sqlx::query(
                        "UPDATE workflow SET status = $2, status_date = now() WHERE id = $1",
                    )
                    .bind(run.workflow_id)
                    .bind(wf_status.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(map_db_err)?;
                }
            }
        }

        tx.commit().await.map_err(map_db_err)?;

        tracing::info!(
            workflow_run_id = run_id,
            from = %observed,
            to = %requested,
            "Workflow run transitioned"
        );
        Ok(updated)
    }

    /// Advance the run's heartbeat. Monotonic under the server clock; a
    /// terminal run rejects the beat so a zombie distributor learns to stop.
    pub async fn log_workflow_run_heartbeat(&self, run_id: i64) -> Result<WorkflowRunRow> {
        let row = sqlx::query_as::<_, WorkflowRunRow>(
            r#"
            UPDATE workflow_run
            SET heartbeat_date = GREATEST(heartbeat_date, now())
            WHERE id = $1 AND status NOT IN ('D', 'E', 'S', 'T', 'A')
            RETURNING id, workflow_id, user_name, status, status_date,
                      heartbeat_date, created_at
            "#,
        )
        .bind(run_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        match row {
            Some(run) => Ok(run),
            None => {
                let existing = self.get_workflow_run(run_id).await?.ok_or_else(|| {
                    JobmonError::not_found(format!("workflow run {} does not exist", run_id))
                })?;
                Err(JobmonError::InvalidTransition {
                    entity: "workflow_run",
                    id: run_id,
                    from: existing.status,
                    to: "heartbeat".to_string(),
                })
            }
        }
    }
}

/// Which workflow status shadows a given run status. Linking and the resume
/// flags leave the workflow untouched.
fn workflow_status_for_run(run_status: WorkflowRunStatus) -> Option<WorkflowStatus> {
    match run_status {
        WorkflowRunStatus::Bound => Some(WorkflowStatus::Queued),
        WorkflowRunStatus::Instantiated => Some(WorkflowStatus::Instantiating),
        WorkflowRunStatus::Launched => Some(WorkflowStatus::Launched),
        WorkflowRunStatus::Running => Some(WorkflowStatus::Running),
        WorkflowRunStatus::Done => Some(WorkflowStatus::Done),
        WorkflowRunStatus::Error => Some(WorkflowStatus::Failed),
        WorkflowRunStatus::Stopped => Some(WorkflowStatus::Halted),
        WorkflowRunStatus::Terminated => Some(WorkflowStatus::Failed),
        WorkflowRunStatus::Aborted => Some(WorkflowStatus::Aborted),
        WorkflowRunStatus::Registered
        | WorkflowRunStatus::Linking
        | WorkflowRunStatus::ColdResume
        | WorkflowRunStatus::HotResume => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_progress_shadows_workflow() {
        assert_eq!(
            workflow_status_for_run(WorkflowRunStatus::Running),
            Some(WorkflowStatus::Running)
        );
        assert_eq!(
            workflow_status_for_run(WorkflowRunStatus::Terminated),
            Some(WorkflowStatus::Failed)
        );
        assert_eq!(workflow_status_for_run(WorkflowRunStatus::Linking), None);
        assert_eq!(workflow_status_for_run(WorkflowRunStatus::HotResume), None);
    }
}
