// Tools, templates, nodes and DAGs: created once, immutable afterwards.
//
// Everything here is get-or-create so that rebinding a workflow after a
// resume converges on the same rows instead of erroring on uniqueness.

use jobmon_core::hash::{content_hash, dag_hash};
use jobmon_core::{JobmonError, Result};

use crate::db::{map_db_err, Database};
use crate::models::*;

impl Database {
    // ============================================
    // Tools
    // ============================================

    pub async fn get_or_create_tool(&self, name: &str) -> Result<ToolRow> {
        let row = sqlx::query_as::<_, ToolRow>(
            r#"
            INSERT INTO tool (name)
            VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name, created_at
            "#,
        )
        .bind(name)
        .fetch_one(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    pub async fn create_tool_version(&self, tool_id: i64) -> Result<ToolVersionRow> {
        let row = sqlx::query_as::<_, ToolVersionRow>(
            r#"
            INSERT INTO tool_version (tool_id)
            VALUES ($1)
            RETURNING id, tool_id, created_at
            "#,
        )
        .bind(tool_id)
        .fetch_one(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    pub async fn get_tool_version(&self, id: i64) -> Result<Option<ToolVersionRow>> {
        let row = sqlx::query_as::<_, ToolVersionRow>(
            "SELECT id, tool_id, created_at FROM tool_version WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    // ============================================
    // Task templates
    // ============================================

    pub async fn get_or_create_task_template(
        &self,
        tool_id: i64,
        name: &str,
    ) -> Result<TaskTemplateRow> {
        let row = sqlx::query_as::<_, TaskTemplateRow>(
            r#"
            INSERT INTO task_template (tool_id, name)
            VALUES ($1, $2)
            ON CONFLICT (tool_id, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, tool_id, name, created_at
            "#,
        )
        .bind(tool_id)
        .bind(name)
        .fetch_one(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    pub async fn get_or_create_task_template_version(
        &self,
        input: CreateTaskTemplateVersion,
    ) -> Result<TaskTemplateVersionRow> {
        // The hash pins the argument shape: same template + same shape = same
        // version row, across workflows.
        let mut parts = vec![input.command_template.clone()];
        parts.extend(input.node_args.iter().cloned());
        parts.extend(input.task_args.iter().cloned());
        parts.extend(input.op_args.iter().cloned());
        let arg_mapping_hash = content_hash(&parts);

        let row = sqlx::query_as::<_, TaskTemplateVersionRow>(
            r#"
            INSERT INTO task_template_version
                (task_template_id, tool_version_id, command_template,
                 node_args, task_args, op_args, arg_mapping_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (task_template_id, tool_version_id, arg_mapping_hash)
                DO UPDATE SET arg_mapping_hash = EXCLUDED.arg_mapping_hash
            RETURNING id, task_template_id, tool_version_id, command_template,
                      node_args, task_args, op_args, arg_mapping_hash, created_at
            "#,
        )
        .bind(input.task_template_id)
        .bind(input.tool_version_id)
        .bind(&input.command_template)
        .bind(&input.node_args)
        .bind(&input.task_args)
        .bind(&input.op_args)
        .bind(&arg_mapping_hash)
        .fetch_one(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    // ============================================
    // Nodes
    // ============================================

    /// Get or create the nodes for a batch of (template version, args hash)
    /// pairs. Returns them in input order.
    pub async fn get_or_create_nodes(
        &self,
        pairs: &[(i64, String)],
    ) -> Result<Vec<NodeRow>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let ttv_ids: Vec<i64> = pairs.iter().map(|p| p.0).collect();
        let hashes: Vec<String> = pairs.iter().map(|p| p.1.clone()).collect();

        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        sqlx::query(
            r#"
            INSERT INTO node (task_template_version_id, node_args_hash)
            SELECT * FROM UNNEST($1::bigint[], $2::text[])
            ON CONFLICT (task_template_version_id, node_args_hash) DO NOTHING
            "#,
        )
        .bind(&ttv_ids)
        .bind(&hashes)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let rows = sqlx::query_as::<_, NodeRow>(
            r#"
            SELECT n.id, n.task_template_version_id, n.node_args_hash, n.created_at
            FROM UNNEST($1::bigint[], $2::text[]) WITH ORDINALITY
                AS input(ttv_id, args_hash, ord)
            JOIN node n
                ON n.task_template_version_id = input.ttv_id
               AND n.node_args_hash = input.args_hash
            ORDER BY input.ord
            "#,
        )
        .bind(&ttv_ids)
        .bind(&hashes)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        tx.commit().await.map_err(map_db_err)?;

        Ok(rows)
    }

    // ============================================
    // DAGs
    // ============================================

    /// Get or create a DAG from its node set and edges. Content-addressed:
    /// the same structure always resolves to the same row. Rejects edges
    /// that leave the node set and rejects cycles.
    pub async fn get_or_create_dag(
        &self,
        node_ids: &[i64],
        edges: &[(i64, i64)],
    ) -> Result<DagRow> {
        validate_dag(node_ids, edges)?;
        let hash = dag_hash(node_ids, edges);

        let mut tx = self.pool().begin().await.map_err(map_db_err)?;

        let row = sqlx::query_as::<_, DagRow>(
            r#"
            INSERT INTO dag (hash)
            VALUES ($1)
            ON CONFLICT (hash) DO UPDATE SET hash = EXCLUDED.hash
            RETURNING id, hash, created_at
            "#,
        )
        .bind(&hash)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_err)?;

        sqlx::query(
            r#"
            INSERT INTO dag_node (dag_id, node_id)
            SELECT $1, * FROM UNNEST($2::bigint[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(row.id)
        .bind(node_ids)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;

        if !edges.is_empty() {
            let upstream: Vec<i64> = edges.iter().map(|e| e.0).collect();
            let downstream: Vec<i64> = edges.iter().map(|e| e.1).collect();
            sqlx::query(
                r#"
                INSERT INTO edge (dag_id, node_id, upstream_node_id)
                SELECT $1, d, u FROM UNNEST($2::bigint[], $3::bigint[]) AS input(u, d)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(row.id)
            .bind(&upstream)
            .bind(&downstream)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        }

        tx.commit().await.map_err(map_db_err)?;

        Ok(row)
    }
}

/// Edges must stay inside the node set and the graph must be acyclic.
fn validate_dag(node_ids: &[i64], edges: &[(i64, i64)]) -> Result<()> {
    use std::collections::{HashMap, HashSet, VecDeque};

    let nodes: HashSet<i64> = node_ids.iter().copied().collect();
    for (u, v) in edges {
        if !nodes.contains(u) || !nodes.contains(v) {
            return Err(JobmonError::schema(format!(
                "edge {} -> {} references a node outside the dag",
                u, v
            )));
        }
    }

    // Kahn's algorithm: if a topological order does not consume every node,
    // there is a cycle.
    let mut indegree: HashMap<i64, usize> = nodes.iter().map(|&n| (n, 0)).collect();
    let mut downstream: HashMap<i64, Vec<i64>> = HashMap::new();
    for (u, v) in edges {
        *indegree.entry(*v).or_default() += 1;
        downstream.entry(*u).or_default().push(*v);
    }

    let mut ready: VecDeque<i64> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut seen = 0usize;
    while let Some(n) = ready.pop_front() {
        seen += 1;
        for &next in downstream.get(&n).into_iter().flatten() {
            let d = indegree.get_mut(&next).expect("node present");
            *d -= 1;
            if *d == 0 {
                ready.push_back(next);
            }
        }
    }

    if seen != nodes.len() {
        return Err(JobmonError::schema("dag contains a cycle"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acyclic_dag_passes() {
        assert!(validate_dag(&[1, 2, 3], &[(1, 2), (2, 3), (1, 3)]).is_ok());
    }

    #[test]
    fn cycle_is_rejected() {
        let err = validate_dag(&[1, 2, 3], &[(1, 2), (2, 3), (3, 1)]).unwrap_err();
        assert_eq!(err.kind_str(), "schema_violation");
    }

    #[test]
    fn foreign_edge_is_rejected() {
        assert!(validate_dag(&[1, 2], &[(1, 9)]).is_err());
    }

    #[test]
    fn empty_dag_is_fine() {
        assert!(validate_dag(&[], &[]).is_ok());
        assert!(validate_dag(&[42], &[]).is_ok());
    }
}
