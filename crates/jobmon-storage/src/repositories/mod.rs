// Repository layer for database operations, grouped per entity.
//
// All methods live on `Database`; the split into files follows the entity
// boundaries of the data model. Locking discipline shared by every mutation:
// task rows before task-instance rows, ids in ascending order.

mod array;
mod infra;
mod queries;
mod reaper;
mod task;
mod task_instance;
mod workflow;
mod workflow_run;

pub use array::QueuedBatch;
pub use queries::WorkflowOverview;
pub use reaper::ReapedRun;
pub use task::BULK_UPDATE_CEILING;
pub use task_instance::UsageReport;
pub use workflow::{ResumeOutcome, StopOutcome};

use jobmon_core::Result;
use sqlx::{Postgres, Transaction};

use crate::db::map_db_err;

/// One pending audit entry: (task_id, previous, new).
pub(crate) type AuditEntry = (i64, String, String);

/// Append audit rows for a batch of task transitions, stamped with the
/// server clock.
pub(crate) async fn append_task_audits(
    tx: &mut Transaction<'_, Postgres>,
    entries: &[AuditEntry],
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let task_ids: Vec<i64> = entries.iter().map(|e| e.0).collect();
    let previous: Vec<String> = entries.iter().map(|e| e.1.clone()).collect();
    let new: Vec<String> = entries.iter().map(|e| e.2.clone()).collect();

    sqlx::query(
        r#"
        INSERT INTO task_status_audit (task_id, previous_status, new_status)
        SELECT * FROM UNNEST($1::bigint[], $2::text[], $3::text[])
        "#,
    )
    .bind(&task_ids)
    .bind(&previous)
    .bind(&new)
    .execute(&mut **tx)
    .await
    .map_err(map_db_err)?;

    Ok(())
}
