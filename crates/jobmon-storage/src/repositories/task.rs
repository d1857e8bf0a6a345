// Tasks: binding and the admin status override.

use std::collections::{HashMap, HashSet, VecDeque};

use jobmon_core::states::TaskStatus;
use jobmon_core::{JobmonError, Result};

use crate::db::{map_db_err, Database};
use crate::models::*;
use crate::repositories::{append_task_audits, AuditEntry};

/// Ceiling on a single admin bulk update; recursion may not exceed it either.
pub const BULK_UPDATE_CEILING: usize = 10_000;

impl Database {
    /// Bind a batch of tasks to a workflow. Re-binding an existing task (a
    /// resume rebind) refreshes its command and attempt ceiling but never
    /// touches its status.
    pub async fn create_tasks(
        &self,
        workflow_id: i64,
        array_id: i64,
        inputs: &[CreateTask],
    ) -> Result<Vec<TaskRow>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let node_ids: Vec<i64> = inputs.iter().map(|t| t.node_id).collect();
        let args_hashes: Vec<String> = inputs.iter().map(|t| t.task_args_hash.clone()).collect();
        let names: Vec<String> = inputs.iter().map(|t| t.name.clone()).collect();
        let commands: Vec<String> = inputs.iter().map(|t| t.command.clone()).collect();
        let max_attempts: Vec<i32> = inputs.iter().map(|t| t.max_attempts).collect();
        let resource_scales: Vec<f64> = inputs.iter().map(|t| t.resource_scale).collect();
        let resources: Vec<Option<i64>> = inputs.iter().map(|t| t.task_resources_id).collect();

        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO task
                (workflow_id, node_id, array_id, task_args_hash, name, command,
                 max_attempts, resource_scale, task_resources_id)
            SELECT $1, input.node_id, $2, input.task_args_hash, input.name,
                   input.command, input.max_attempts, input.resource_scale,
                   input.task_resources_id
            FROM UNNEST($3::bigint[], $4::text[], $5::text[], $6::text[],
                        $7::int[], $8::float8[], $9::bigint[])
                AS input(node_id, task_args_hash, name, command, max_attempts,
                         resource_scale, task_resources_id)
            ON CONFLICT (workflow_id, node_id, task_args_hash)
                DO UPDATE SET command = EXCLUDED.command,
                              max_attempts = EXCLUDED.max_attempts,
                              resource_scale = EXCLUDED.resource_scale
            RETURNING id, workflow_id, node_id, array_id, task_args_hash, name,
                      command, status, status_date, num_attempts, max_attempts,
                      resource_scale, task_resources_id, created_at
            "#,
        )
        .bind(workflow_id)
        .bind(array_id)
        .bind(&node_ids)
        .bind(&args_hashes)
        .bind(&names)
        .bind(&commands)
        .bind(&max_attempts)
        .bind(&resource_scales)
        .bind(&resources)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<TaskRow>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, workflow_id, node_id, array_id, task_args_hash, name,
                   command, status, status_date, num_attempts, max_attempts,
                   resource_scale, task_resources_id, created_at
            FROM task WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    pub async fn get_task_audit(&self, task_id: i64) -> Result<Vec<TaskStatusAuditRow>> {
        let rows = sqlx::query_as::<_, TaskStatusAuditRow>(
            r#"
            SELECT id, task_id, previous_status, new_status, status_date
            FROM task_status_audit
            WHERE task_id = $1
            ORDER BY id
            "#,
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    /// Admin override: force a batch of tasks to a status, optionally
    /// fanning out through every downstream task in the DAG. Audited like
    /// any other transition but not constrained by the legality table.
    pub async fn bulk_update_task_status(
        &self,
        task_ids: &[i64],
        new_status: TaskStatus,
        recursive: bool,
    ) -> Result<u64> {
        if task_ids.len() > BULK_UPDATE_CEILING {
            return Err(JobmonError::schema(format!(
                "bulk update limited to {} tasks per call",
                BULK_UPDATE_CEILING
            )));
        }

        let target_ids = if recursive {
            self.downstream_task_closure(task_ids).await?
        } else {
            task_ids.to_vec()
        };
        if target_ids.len() > BULK_UPDATE_CEILING {
            return Err(JobmonError::schema(format!(
                "recursive update expands to {} tasks, over the {} ceiling",
                target_ids.len(),
                BULK_UPDATE_CEILING
            )));
        }

        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        let observed: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, status FROM task WHERE id = ANY($1) ORDER BY id FOR UPDATE",
        )
        .bind(&target_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let changed: Vec<(i64, String)> = observed
            .into_iter()
            .filter(|(_, status)| status != new_status.as_str())
            .collect();

        let audits: Vec<AuditEntry> = changed
            .iter()
            .map(|(id, status)| (*id, status.clone(), new_status.as_str().to_string()))
            .collect();
        append_task_audits(&mut tx, &audits).await?;

        let changed_ids: Vec<i64> = changed.iter().map(|(id, _)| *id).collect();
        if !changed_ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE task
                SET status = $2, status_date = now(),
                    num_attempts = CASE WHEN $2 = 'G' THEN 0 ELSE num_attempts END
                WHERE id = ANY($1)
                "#,
            )
            .bind(&changed_ids)
            .bind(new_status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        }

        tx.commit().await.map_err(map_db_err)?;

        tracing::info!(
            updated = changed_ids.len(),
            status = %new_status,
            recursive,
            "Bulk task status update"
        );
        Ok(changed_ids.len() as u64)
    }

    /// Every task reachable downstream of the given tasks through the DAG,
    /// the given tasks included.
    async fn downstream_task_closure(&self, task_ids: &[i64]) -> Result<Vec<i64>> {
        // One workflow per call keeps the node->task mapping unambiguous.
        let workflows: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT workflow_id FROM task WHERE id = ANY($1)",
        )
        .bind(task_ids)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        let workflow_id = match workflows.as_slice() {
            [] => return Ok(Vec::new()),
            [(id,)] => *id,
            _ => {
                return Err(JobmonError::schema(
                    "recursive update must stay within one workflow",
                ))
            }
        };

        let node_to_task: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT node_id, id FROM task WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        let edges: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT e.upstream_node_id, e.node_id
            FROM edge e
            JOIN workflow w ON w.dag_id = e.dag_id
            WHERE w.id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        let seeds: Vec<i64> = sqlx::query_as::<_, (i64,)>(
            "SELECT node_id FROM task WHERE id = ANY($1)",
        )
        .bind(task_ids)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?
        .into_iter()
        .map(|r| r.0)
        .collect();

        let closure_nodes = downstream_closure(&seeds, &edges);
        let task_map: HashMap<i64, i64> = node_to_task.into_iter().collect();
        let mut out: Vec<i64> = closure_nodes
            .into_iter()
            .filter_map(|node| task_map.get(&node).copied())
            .collect();
        out.sort_unstable();
        Ok(out)
    }
}

/// BFS over the downstream edge relation; seeds are included in the result.
fn downstream_closure(seeds: &[i64], edges: &[(i64, i64)]) -> Vec<i64> {
    let mut downstream: HashMap<i64, Vec<i64>> = HashMap::new();
    for (up, down) in edges {
        downstream.entry(*up).or_default().push(*down);
    }

    let mut seen: HashSet<i64> = seeds.iter().copied().collect();
    let mut queue: VecDeque<i64> = seeds.iter().copied().collect();
    while let Some(node) = queue.pop_front() {
        for &next in downstream.get(&node).into_iter().flatten() {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }

    let mut out: Vec<i64> = seen.into_iter().collect();
    out.sort_unstable();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_includes_seeds_and_descendants() {
        // 1 -> 2 -> 3, 2 -> 4, 5 isolated
        let edges = vec![(1, 2), (2, 3), (2, 4)];
        assert_eq!(downstream_closure(&[1], &edges), vec![1, 2, 3, 4]);
        assert_eq!(downstream_closure(&[2], &edges), vec![2, 3, 4]);
        assert_eq!(downstream_closure(&[5], &edges), vec![5]);
    }

    #[test]
    fn closure_handles_diamonds_once() {
        // 1 -> {2,3} -> 4
        let edges = vec![(1, 2), (1, 3), (2, 4), (3, 4)];
        assert_eq!(downstream_closure(&[1], &edges), vec![1, 2, 3, 4]);
    }
}
