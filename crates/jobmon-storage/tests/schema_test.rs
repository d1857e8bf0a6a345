// Schema smoke test.
//
// #[sqlx::test] provisions a fresh database and applies ./migrations before
// the body runs, so a migration that fails to parse breaks `cargo test`
// outright instead of hiding behind the ignored end-to-end suite. Needs
// DATABASE_URL pointing at a Postgres server with create-database rights.

use jobmon_core::states::TaskStatus;
use jobmon_storage::models::{CreateTask, CreateTaskTemplateVersion, CreateWorkflow};
use jobmon_storage::Database;

#[sqlx::test]
async fn migration_applies_and_dispatch_path_works(pool: sqlx::PgPool) {
    let db = Database::new(pool);

    let tool = db.get_or_create_tool("schema-smoke").await.unwrap();
    let again = db.get_or_create_tool("schema-smoke").await.unwrap();
    assert_eq!(tool.id, again.id, "get-or-create converges on one row");

    let tool_version = db.create_tool_version(tool.id).await.unwrap();
    let template = db
        .get_or_create_task_template(tool.id, "smoke-template")
        .await
        .unwrap();
    let ttv = db
        .get_or_create_task_template_version(CreateTaskTemplateVersion {
            task_template_id: template.id,
            tool_version_id: tool_version.id,
            command_template: "echo {arg}".to_string(),
            node_args: vec!["arg".to_string()],
            task_args: Vec::new(),
            op_args: Vec::new(),
        })
        .await
        .unwrap();

    let nodes = db
        .get_or_create_nodes(&[(ttv.id, "node-0".to_string())])
        .await
        .unwrap();
    let dag = db.get_or_create_dag(&[nodes[0].id], &[]).await.unwrap();

    let workflow = db
        .create_workflow(CreateWorkflow {
            tool_version_id: tool_version.id,
            dag_id: dag.id,
            workflow_args_hash: "smoke-args".to_string(),
            name: Some("schema-smoke".to_string()),
            user_name: "smoke".to_string(),
            max_concurrently_running: 10,
        })
        .await
        .unwrap();

    let array = db
        .get_or_create_array(workflow.id, ttv.id, "smoke-array", 10)
        .await
        .unwrap();
    assert_eq!(array.batch_number, 0);

    let tasks = db
        .create_tasks(
            workflow.id,
            array.id,
            &[CreateTask {
                node_id: nodes[0].id,
                task_args_hash: "t0".to_string(),
                name: "task-0".to_string(),
                command: "echo 0".to_string(),
                max_attempts: 3,
                resource_scale: 1.5,
                task_resources_id: None,
            }],
        )
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_status().unwrap(), TaskStatus::Registering);

    let run = db.create_workflow_run(workflow.id, "smoke").await.unwrap();

    // Queue one batch: bumps the array batch number, moves the task to Q
    // with an audit row, creates the instance.
    let batch = db
        .queue_task_batch(array.id, &[tasks[0].id], None, run.id)
        .await
        .unwrap();
    assert_eq!(batch.batch_number, 1);
    assert_eq!(batch.task_instance_ids.len(), 1);

    let task = db.get_task(tasks[0].id).await.unwrap().unwrap();
    assert_eq!(task.task_status().unwrap(), TaskStatus::Queued);
    assert_eq!(task.num_attempts, 1);

    let audit = db.get_task_audit(tasks[0].id).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].previous_status, "G");
    assert_eq!(audit[0].new_status, "Q");

    let instance = db
        .get_task_instance(batch.task_instance_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, "Q");
    assert_eq!(instance.array_batch_num, 1);
}
