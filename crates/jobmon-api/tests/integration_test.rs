// Integration tests for the Jobmon API
// Run with: cargo test --test integration_test -- --ignored
// Requires a running server (and database) at localhost:9100.

use serde_json::{json, Value};

const API_BASE_URL: &str = "http://localhost:9100/api/v3";

/// Client carrying the identity header, for servers running with auth
/// enabled (the default).
fn api_client() -> reqwest::Client {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        "x-jobmon-user",
        reqwest::header::HeaderValue::from_static("integration-test"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .expect("client")
}

struct Bound {
    workflow_id: i64,
    workflow_run_id: i64,
    array_id: i64,
    task_ids: Vec<i64>,
}

/// Bind tool -> template -> nodes -> dag -> workflow -> run -> array ->
/// tasks, returning the ids the scenarios need.
async fn bind_single_task_workflow(client: &reqwest::Client, tag: &str) -> Bound {
    bind_workflow_with_tasks(client, tag, 1).await
}

async fn bind_workflow_with_tasks(client: &reqwest::Client, tag: &str, n_tasks: usize) -> Bound {
    let tool: Value = client
        .post(format!("{}/tool", API_BASE_URL))
        .json(&json!({ "name": format!("integration-tool-{}", tag) }))
        .send()
        .await
        .expect("create tool")
        .json()
        .await
        .expect("parse tool");
    let tool_id = tool["id"].as_i64().unwrap();

    let tool_version: Value = client
        .post(format!("{}/tool/{}/tool_version", API_BASE_URL, tool_id))
        .send()
        .await
        .expect("create tool version")
        .json()
        .await
        .expect("parse tool version");
    let tool_version_id = tool_version["id"].as_i64().unwrap();

    let template: Value = client
        .post(format!("{}/task_template", API_BASE_URL))
        .json(&json!({ "tool_id": tool_id, "name": format!("tt-{}", tag) }))
        .send()
        .await
        .expect("create template")
        .json()
        .await
        .expect("parse template");
    let template_id = template["id"].as_i64().unwrap();

    let ttv: Value = client
        .post(format!(
            "{}/task_template/{}/task_template_version",
            API_BASE_URL, template_id
        ))
        .json(&json!({
            "tool_version_id": tool_version_id,
            "command_template": "echo {arg}",
            "node_args": ["arg"]
        }))
        .send()
        .await
        .expect("create ttv")
        .json()
        .await
        .expect("parse ttv");
    let ttv_id = ttv["id"].as_i64().unwrap();

    let node_specs: Vec<Value> = (0..n_tasks)
        .map(|i| {
            json!({
                "task_template_version_id": ttv_id,
                "node_args_hash": format!("node-{}-{}", tag, i)
            })
        })
        .collect();
    let nodes: Value = client
        .post(format!("{}/node/bind", API_BASE_URL))
        .json(&json!({ "nodes": node_specs }))
        .send()
        .await
        .expect("bind nodes")
        .json()
        .await
        .expect("parse nodes");
    let node_ids: Vec<i64> = nodes["node_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();

    let dag: Value = client
        .post(format!("{}/dag/bind", API_BASE_URL))
        .json(&json!({ "node_ids": node_ids, "edges": [] }))
        .send()
        .await
        .expect("bind dag")
        .json()
        .await
        .expect("parse dag");
    let dag_id = dag["id"].as_i64().unwrap();

    let workflow: Value = client
        .post(format!("{}/workflow/bind", API_BASE_URL))
        .json(&json!({
            "tool_version_id": tool_version_id,
            "dag_id": dag_id,
            "workflow_args_hash": format!("wf-args-{}", tag),
            "name": format!("integration-{}", tag)
        }))
        .send()
        .await
        .expect("bind workflow")
        .json()
        .await
        .expect("parse workflow");
    let workflow_id = workflow["id"].as_i64().unwrap();

    let array: Value = client
        .post(format!("{}/workflow/{}/array", API_BASE_URL, workflow_id))
        .json(&json!({
            "task_template_version_id": ttv_id,
            "name": format!("array-{}", tag)
        }))
        .send()
        .await
        .expect("create array")
        .json()
        .await
        .expect("parse array");
    let array_id = array["id"].as_i64().unwrap();

    let task_specs: Vec<Value> = node_ids
        .iter()
        .enumerate()
        .map(|(i, node_id)| {
            json!({
                "node_id": node_id,
                "task_args_hash": format!("task-args-{}-{}", tag, i),
                "name": format!("task-{}-{}", tag, i),
                "command": format!("echo {}", i),
                "max_attempts": 3
            })
        })
        .collect();
    let tasks: Value = client
        .post(format!("{}/workflow/{}/tasks", API_BASE_URL, workflow_id))
        .json(&json!({ "array_id": array_id, "tasks": task_specs }))
        .send()
        .await
        .expect("bind tasks")
        .json()
        .await
        .expect("parse tasks");
    let task_ids: Vec<i64> = tasks["task_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();

    let run_response = client
        .post(format!("{}/workflow/{}/workflow_run", API_BASE_URL, workflow_id))
        .send()
        .await
        .expect("create run");
    assert_eq!(run_response.status(), 201);
    let run: Value = run_response.json().await.expect("parse run");

    Bound {
        workflow_id,
        workflow_run_id: run["id"].as_i64().unwrap(),
        array_id,
        task_ids,
    }
}

async fn task_status(client: &reqwest::Client, task_id: i64) -> String {
    let task: Value = client
        .get(format!("{}/task/{}", API_BASE_URL, task_id))
        .send()
        .await
        .expect("get task")
        .json()
        .await
        .expect("parse task");
    task["status"].as_str().unwrap().to_string()
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_happy_path_single_task() {
    let client = api_client();
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();

    println!("🧪 Happy path: one task through G→Q→I→O→R→D...");
    let bound = bind_single_task_workflow(&client, &format!("happy-{}", ts)).await;
    let task_id = bound.task_ids[0];

    // Queue the batch
    let batch: Value = client
        .post(format!(
            "{}/array/{}/queue_task_batch",
            API_BASE_URL, bound.array_id
        ))
        .json(&json!({
            "task_ids": bound.task_ids,
            "workflow_run_id": bound.workflow_run_id
        }))
        .send()
        .await
        .expect("queue batch")
        .json()
        .await
        .expect("parse batch");
    let instance_ids: Vec<i64> = batch["task_instance_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();
    assert_eq!(instance_ids.len(), 1);
    let batch_number = batch["batch_number"].as_i64().unwrap();
    assert_eq!(task_status(&client, task_id).await, "Q");
    println!("✅ Queued (batch {})", batch_number);

    // Instantiate
    let claimed: Value = client
        .post(format!(
            "{}/task_instance/instantiate_task_instances",
            API_BASE_URL
        ))
        .json(&json!({ "task_instance_ids": instance_ids }))
        .send()
        .await
        .expect("instantiate")
        .json()
        .await
        .expect("parse instantiate");
    assert_eq!(claimed["task_instance_ids"].as_array().unwrap().len(), 1);
    assert_eq!(task_status(&client, task_id).await, "I");
    println!("✅ Instantiated");

    // Launch the batch
    let launch_response = client
        .post(format!(
            "{}/array/{}/transition_to_launched",
            API_BASE_URL, bound.array_id
        ))
        .json(&json!({ "batch_number": batch_number, "next_report_increment": 300 }))
        .send()
        .await
        .expect("launch");
    assert_eq!(launch_response.status(), 200);
    assert_eq!(task_status(&client, task_id).await, "O");
    println!("✅ Launched");

    // Worker reports running, then done
    let instance_id = instance_ids[0];
    let running_response = client
        .post(format!(
            "{}/task_instance/{}/log_running",
            API_BASE_URL, instance_id
        ))
        .json(&json!({ "nodename": "node-001", "next_report_increment": 300 }))
        .send()
        .await
        .expect("log running");
    assert_eq!(running_response.status(), 200);
    assert_eq!(task_status(&client, task_id).await, "R");

    let done_response = client
        .post(format!("{}/task_instance/{}/log_done", API_BASE_URL, instance_id))
        .json(&json!({ "wallclock_seconds": 12.5, "maxrss_bytes": 1048576 }))
        .send()
        .await
        .expect("log done");
    assert_eq!(done_response.status(), 200);
    assert_eq!(task_status(&client, task_id).await, "D");
    println!("✅ Done");

    // log_done twice is idempotent
    let again = client
        .post(format!("{}/task_instance/{}/log_done", API_BASE_URL, instance_id))
        .json(&json!({}))
        .send()
        .await
        .expect("log done again");
    assert_eq!(again.status(), 200, "repeated log_done must succeed");

    // Audit chain: G→Q→I→O→R→D
    let audit: Value = client
        .get(format!("{}/task/{}/status_audit", API_BASE_URL, task_id))
        .send()
        .await
        .expect("audit")
        .json()
        .await
        .expect("parse audit");
    let chain: Vec<(String, String)> = audit
        .as_array()
        .unwrap()
        .iter()
        .map(|e| {
            (
                e["previous_status"].as_str().unwrap().to_string(),
                e["new_status"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    let expected = [
        ("G", "Q"),
        ("Q", "I"),
        ("I", "O"),
        ("O", "R"),
        ("R", "D"),
    ];
    assert_eq!(chain.len(), expected.len(), "audit chain: {:?}", chain);
    for ((prev, new), (want_prev, want_new)) in chain.iter().zip(expected.iter()) {
        assert_eq!(prev, want_prev);
        assert_eq!(new, want_new);
    }
    // consecutive rows link up
    for pair in chain.windows(2) {
        assert_eq!(pair[0].1, pair[1].0);
    }
    println!("🎉 Audit chain verified");
}

#[tokio::test]
#[ignore]
async fn test_kill_mid_flight() {
    let client = api_client();
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();

    println!("🧪 Kill mid-flight: launched task, stop, sweep, late log_done...");
    let bound = bind_single_task_workflow(&client, &format!("kill-{}", ts)).await;
    let task_id = bound.task_ids[0];

    let batch: Value = client
        .post(format!(
            "{}/array/{}/queue_task_batch",
            API_BASE_URL, bound.array_id
        ))
        .json(&json!({
            "task_ids": bound.task_ids,
            "workflow_run_id": bound.workflow_run_id
        }))
        .send()
        .await
        .expect("queue")
        .json()
        .await
        .expect("parse");
    let instance_id = batch["task_instance_ids"][0].as_i64().unwrap();
    let batch_number = batch["batch_number"].as_i64().unwrap();

    client
        .post(format!(
            "{}/task_instance/instantiate_task_instances",
            API_BASE_URL
        ))
        .json(&json!({ "task_instance_ids": [instance_id] }))
        .send()
        .await
        .expect("instantiate");
    client
        .post(format!(
            "{}/array/{}/transition_to_launched",
            API_BASE_URL, bound.array_id
        ))
        .json(&json!({ "batch_number": batch_number, "next_report_increment": 300 }))
        .send()
        .await
        .expect("launch");
    assert_eq!(task_status(&client, task_id).await, "O");

    // Stop flags the instance for kill
    let stop: Value = client
        .post(format!("{}/workflow/{}/stop", API_BASE_URL, bound.workflow_id))
        .send()
        .await
        .expect("stop")
        .json()
        .await
        .expect("parse stop");
    assert_eq!(stop["instances_killed"].as_u64().unwrap(), 1);

    // The sweep confirms: instance K→F, task O→F
    let killed: Value = client
        .post(format!(
            "{}/array/{}/transition_to_killed",
            API_BASE_URL, bound.array_id
        ))
        .json(&json!({ "batch_number": batch_number }))
        .send()
        .await
        .expect("kill")
        .json()
        .await
        .expect("parse kill");
    assert_eq!(killed["transitioned"].as_u64().unwrap(), 1);
    assert_eq!(task_status(&client, task_id).await, "F");

    // A worker racing the kill gets a hard invalid-transition error
    let late_done = client
        .post(format!("{}/task_instance/{}/log_done", API_BASE_URL, instance_id))
        .json(&json!({}))
        .send()
        .await
        .expect("late done");
    assert_eq!(late_done.status(), 409);
    let body: Value = late_done.json().await.expect("parse error");
    assert_eq!(body["error_kind"], "invalid_transition");
    println!("🎉 Kill semantics verified");
}

#[tokio::test]
#[ignore]
async fn test_resume_excluding_running() {
    let client = api_client();
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();

    println!("🧪 Resume: {{t1:D, t2:R, t3:F, t4:Q}} with reset_if_running=false...");
    let bound = bind_workflow_with_tasks(&client, &format!("resume-{}", ts), 4).await;
    let [t1, t2, t3, t4] = [
        bound.task_ids[0],
        bound.task_ids[1],
        bound.task_ids[2],
        bound.task_ids[3],
    ];

    // Drive t1 to D, t2 to R, t3 to F via the admin override, t4 to Q.
    for (task_id, status) in [(t1, "D"), (t2, "R"), (t3, "F"), (t4, "Q")] {
        let response = client
            .put(format!("{}/task/update_statuses", API_BASE_URL))
            .json(&json!({ "task_ids": [task_id], "new_status": status }))
            .send()
            .await
            .expect("admin update");
        assert_eq!(response.status(), 200);
    }

    // Signal resume on the live run, then reset.
    client
        .put(format!(
            "{}/workflow_run/{}/update_status",
            API_BASE_URL, bound.workflow_run_id
        ))
        .json(&json!({ "status": "C" }))
        .send()
        .await
        .expect("flag resume");

    let resume: Value = client
        .post(format!(
            "{}/task/{}/set_resume_state",
            API_BASE_URL, bound.workflow_id
        ))
        .json(&json!({ "reset_if_running": false }))
        .send()
        .await
        .expect("resume")
        .json()
        .await
        .expect("parse resume");
    assert_eq!(resume["tasks_reset"].as_u64().unwrap(), 2);

    assert_eq!(task_status(&client, t1).await, "D", "done tasks keep outputs");
    assert_eq!(task_status(&client, t2).await, "R", "running excluded");
    assert_eq!(task_status(&client, t3).await, "G");
    assert_eq!(task_status(&client, t4).await, "G");
    println!("🎉 Resume semantics verified");
}

#[tokio::test]
#[ignore]
async fn test_health_endpoint() {
    let client = api_client();

    let response = client
        .get("http://localhost:9100/health")
        .send()
        .await
        .expect("health");
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("parse health");
    assert_eq!(body["status"], "ok");
    assert!(body["api_versions"]
        .as_array()
        .unwrap()
        .iter()
        .any(|v| v == "v3"));
}

#[tokio::test]
#[ignore]
async fn test_resource_usage_boundaries() {
    let client = api_client();

    // A template version that has no finished instances: all stats null.
    let response = client
        .get(format!(
            "{}/task_template/999999999/resource_usage?confidence=0.95",
            API_BASE_URL
        ))
        .send()
        .await
        .expect("resource usage");
    assert_eq!(response.status(), 200);
    let stats: Value = response.json().await.expect("parse stats");
    assert_eq!(stats["num_tasks"].as_u64().unwrap(), 0);
    assert!(stats["mean_mem"].is_null());
    assert!(stats["ci_mem"].is_null());
}

#[tokio::test]
#[ignore]
async fn test_get_max_concurrently_running_404() {
    let client = api_client();

    let response = client
        .get(format!(
            "{}/get_max_concurrently_running?workflow_id=999999999",
            API_BASE_URL
        ))
        .send()
        .await
        .expect("cap lookup");
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.expect("parse body");
    assert_eq!(body["error_kind"], "not_found");
}
