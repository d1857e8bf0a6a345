// Read-only queries: operator observability and the distributor's drain.
//
// Each method is a single read transaction (one pool round trip per
// statement, nothing held across awaits outside the pool).

use jobmon_core::Result;

use crate::db::{map_db_err, Database};
use crate::models::*;

/// Workflow plus its task status histogram.
#[derive(Debug, Clone)]
pub struct WorkflowOverview {
    pub workflow: WorkflowRow,
    pub task_status_counts: Vec<StatusCountRow>,
}

impl Database {
    pub async fn workflow_overview(&self, workflow_id: i64) -> Result<Option<WorkflowOverview>> {
        let workflow = match self.get_workflow(workflow_id).await? {
            Some(w) => w,
            None => return Ok(None),
        };

        let task_status_counts = sqlx::query_as::<_, StatusCountRow>(
            r#"
            SELECT status, count(*) AS count
            FROM task
            WHERE workflow_id = $1
            GROUP BY status
            ORDER BY status
            "#,
        )
        .bind(workflow_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(Some(WorkflowOverview {
            workflow,
            task_status_counts,
        }))
    }

    pub async fn task_template_status_counts(
        &self,
        workflow_id: i64,
    ) -> Result<Vec<TemplateStatusCountRow>> {
        let rows = sqlx::query_as::<_, TemplateStatusCountRow>(
            r#"
            SELECT tt.name AS task_template_name, t.status, count(*) AS count
            FROM task t
            JOIN task_array a ON a.id = t.array_id
            JOIN task_template_version ttv ON ttv.id = a.task_template_version_id
            JOIN task_template tt ON tt.id = ttv.task_template_id
            WHERE t.workflow_id = $1
            GROUP BY tt.name, t.status
            ORDER BY tt.name, t.status
            "#,
        )
        .bind(workflow_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    pub async fn task_table(
        &self,
        workflow_id: i64,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskSummaryRow>> {
        let rows = sqlx::query_as::<_, TaskSummaryRow>(
            r#"
            SELECT t.id, t.name, t.status, t.status_date, t.num_attempts,
                   t.max_attempts, a.name AS array_name
            FROM task t
            JOIN task_array a ON a.id = t.array_id
            WHERE t.workflow_id = $1 AND ($2::text IS NULL OR t.status = $2)
            ORDER BY t.id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(workflow_id)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    /// Errors across a workflow, clustered by identical description.
    pub async fn clustered_errors(
        &self,
        workflow_id: i64,
        limit: i64,
    ) -> Result<Vec<ClusteredErrorRow>> {
        let rows = sqlx::query_as::<_, ClusteredErrorRow>(
            r#"
            SELECT el.description,
                   count(*) AS occurrences,
                   min(el.error_time) AS first_seen,
                   max(el.error_time) AS last_seen,
                   max(el.task_instance_id) AS sample_task_instance_id
            FROM task_instance_error_log el
            JOIN task_instance ti ON ti.id = el.task_instance_id
            JOIN task t ON t.id = ti.task_id
            WHERE t.workflow_id = $1
            GROUP BY el.description
            ORDER BY occurrences DESC, last_seen DESC
            LIMIT $2
            "#,
        )
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    /// Usage samples for every successful instance of a template version.
    pub async fn resource_usage_samples(
        &self,
        task_template_version_id: i64,
    ) -> Result<Vec<UsageSampleRow>> {
        let rows = sqlx::query_as::<_, UsageSampleRow>(
            r#"
            SELECT ti.maxrss_bytes, ti.wallclock_seconds
            FROM task_instance ti
            JOIN task t ON t.id = ti.task_id
            JOIN node n ON n.id = t.node_id
            WHERE n.task_template_version_id = $1 AND ti.status = 'D'
            "#,
        )
        .bind(task_template_version_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    /// Template-level shape of a workflow's DAG: each template and the
    /// template ids directly downstream of it.
    pub async fn task_template_dag(&self, workflow_id: i64) -> Result<Vec<TemplateDagEdgeRow>> {
        let rows = sqlx::query_as::<_, TemplateDagEdgeRow>(
            r#"
            SELECT DISTINCT up_tt.name, down_ttv.task_template_id AS downstream_task_template_id
            FROM workflow w
            JOIN edge e ON e.dag_id = w.dag_id
            JOIN node up_n ON up_n.id = e.upstream_node_id
            JOIN node down_n ON down_n.id = e.node_id
            JOIN task_template_version up_ttv ON up_ttv.id = up_n.task_template_version_id
            JOIN task_template_version down_ttv ON down_ttv.id = down_n.task_template_version_id
            JOIN task_template up_tt ON up_tt.id = up_ttv.task_template_id
            WHERE w.id = $1
            ORDER BY up_tt.name, downstream_task_template_id
            "#,
        )
        .bind(workflow_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    // ============================================
    // Distributor drain
    // ============================================

    /// Queued instances the distributor may claim right now, honoring the
    /// workflow cap and each array's cap.
    pub async fn queued_task_instances(
        &self,
        workflow_run_id: i64,
        limit: i64,
    ) -> Result<Vec<QueuedInstanceRow>> {
        let workflow: Option<(i64, i32)> = sqlx::query_as(
            r#"
            SELECT w.id, w.max_concurrently_running
            FROM workflow w
            JOIN workflow_run r ON r.workflow_id = w.id
            WHERE r.id = $1
            "#,
        )
        .bind(workflow_run_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        let (workflow_id, workflow_cap) = match workflow {
            Some(w) => w,
            None => return Ok(Vec::new()),
        };

        let active: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT array_id, count(*)
            FROM task
            WHERE workflow_id = $1 AND status IN ('I', 'O', 'R')
            GROUP BY array_id
            "#,
        )
        .bind(workflow_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        let array_caps: Vec<(i64, i32)> = sqlx::query_as(
            "SELECT id, max_concurrently_running FROM task_array WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        let candidates = sqlx::query_as::<_, QueuedInstanceRow>(
            r#"
            SELECT ti.id, ti.task_id, ti.array_id, ti.array_batch_num,
                   ti.task_resources_id, t.command, tr.requested_resources
            FROM task_instance ti
            JOIN task t ON t.id = ti.task_id
            LEFT JOIN task_resources tr ON tr.id = ti.task_resources_id
            WHERE ti.workflow_run_id = $1 AND ti.status = 'Q' AND t.status = 'Q'
            ORDER BY ti.id
            LIMIT $2
            "#,
        )
        .bind(workflow_run_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        let total_active: i64 = active.iter().map(|(_, n)| n).sum();
        let workflow_remaining = (workflow_cap as i64 - total_active).max(0) as usize;
        let per_array_remaining: std::collections::HashMap<i64, usize> = array_caps
            .into_iter()
            .map(|(array_id, cap)| {
                let used = active
                    .iter()
                    .find(|(id, _)| *id == array_id)
                    .map(|(_, n)| *n)
                    .unwrap_or(0);
                (array_id, (cap as i64 - used).max(0) as usize)
            })
            .collect();

        Ok(plan_drain(workflow_remaining, &per_array_remaining, candidates))
    }

    /// Tasks waiting on a resource rebind for this run's workflow, with the
    /// resource request of their last attempt.
    pub async fn adjusting_tasks(&self, workflow_run_id: i64) -> Result<Vec<AdjustingTaskRow>> {
        let rows = sqlx::query_as::<_, AdjustingTaskRow>(
            r#"
            SELECT t.id, t.array_id, t.resource_scale, tr.requested_resources
            FROM task t
            JOIN workflow_run r ON r.workflow_id = t.workflow_id
            LEFT JOIN task_resources tr ON tr.id = t.task_resources_id
            WHERE r.id = $1 AND t.status = 'A'
            ORDER BY t.id
            "#,
        )
        .bind(workflow_run_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    /// Persist a resource request, returning its id for dispatch.
    pub async fn create_task_resources(
        &self,
        requested_resources: &serde_json::Value,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO task_resources (requested_resources) VALUES ($1) RETURNING id",
        )
        .bind(requested_resources)
        .fetch_one(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row.0)
    }
}

/// Trim the candidate list to the remaining workflow capacity, then to each
/// array's remaining capacity, preserving queue order.
fn plan_drain(
    workflow_remaining: usize,
    per_array_remaining: &std::collections::HashMap<i64, usize>,
    candidates: Vec<QueuedInstanceRow>,
) -> Vec<QueuedInstanceRow> {
    let mut taken_per_array: std::collections::HashMap<i64, usize> =
        std::collections::HashMap::new();
    let mut out = Vec::new();

    for candidate in candidates {
        if out.len() >= workflow_remaining {
            break;
        }
        let cap = per_array_remaining
            .get(&candidate.array_id)
            .copied()
            .unwrap_or(usize::MAX);
        let taken = taken_per_array.entry(candidate.array_id).or_insert(0);
        if *taken >= cap {
            continue;
        }
        *taken += 1;
        out.push(candidate);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn candidate(id: i64, array_id: i64) -> QueuedInstanceRow {
        QueuedInstanceRow {
            id,
            task_id: id,
            array_id,
            array_batch_num: 1,
            task_resources_id: None,
            command: "echo".to_string(),
            requested_resources: None,
        }
    }

    #[test]
    fn workflow_cap_bounds_total() {
        let caps = HashMap::from([(1, 10)]);
        let out = plan_drain(2, &caps, vec![candidate(1, 1), candidate(2, 1), candidate(3, 1)]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, 1);
    }

    #[test]
    fn array_cap_bounds_per_array_but_not_others() {
        let caps = HashMap::from([(1, 1), (2, 10)]);
        let out = plan_drain(
            10,
            &caps,
            vec![candidate(1, 1), candidate(2, 1), candidate(3, 2), candidate(4, 2)],
        );
        let ids: Vec<i64> = out.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 3, 4]);
    }

    #[test]
    fn exhausted_workflow_capacity_takes_nothing() {
        let caps = HashMap::from([(1, 5)]);
        let out = plan_drain(0, &caps, vec![candidate(1, 1)]);
        assert!(out.is_empty());
    }
}
