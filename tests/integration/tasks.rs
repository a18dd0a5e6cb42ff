use crate::*;

/// Higher priority first, then a full assign → ack → result round trip.
#[tokio::test]
async fn test_priority_order_and_completion() {
    let hive = Hive::start(fast_config()).await.unwrap();
    let low = hive
        .submit(json!({"task_type": "resize", "payload": {"img": "a.png"}, "priority": 1}))
        .await
        .unwrap();
    let high = hive
        .submit(json!({"task_type": "resize", "payload": {"img": "b.png"}, "priority": 5}))
        .await
        .unwrap();
    assert_eq!(hive.task(&low).await.unwrap()["state"], "PENDING");
    assert_eq!(hive.task(&high).await.unwrap()["state"], "PENDING");

    let mut node = Node::join(hive.gateway).await.unwrap();

    let first = node.expect("assign").await.unwrap();
    assert_eq!(first["task_id"], high.as_str());
    assert_eq!(first["task_type"], "resize");
    assert_eq!(first["payload"]["img"], "b.png");
    assert_eq!(first["attempt"], 1);

    let info = hive.node(&node.node_id).await.unwrap();
    assert_eq!(info["state"], "BUSY");
    assert_eq!(info["current_task_id"], high.as_str());

    node.ack(&first).await.unwrap();
    hive.wait_for_task_state(&high, "RUNNING").await.unwrap();

    let ack = node.succeed(&first, json!({"bytes": 1024})).await.unwrap();
    assert_eq!(ack["accepted"], true);

    let done = hive.wait_for_task_state(&high, "SUCCEEDED").await.unwrap();
    assert_eq!(done["result"]["bytes"], 1024);
    assert_eq!(done["assigned_node_id"], node.node_id.as_str());

    let second = node.expect("assign").await.unwrap();
    assert_eq!(second["task_id"], low.as_str());
    node.succeed(&second, json!({})).await.unwrap();
    hive.wait_for_task_state(&low, "SUCCEEDED").await.unwrap();

    let info = hive.wait_for_node_state(&node.node_id, "IDLE").await.unwrap();
    assert_eq!(info["tasks_completed"], 2);
}

/// A failure report with attempts left puts the task back in the queue.
#[tokio::test]
async fn test_failure_is_retried_until_attempts_run_out() {
    let hive = Hive::start(fast_config()).await.unwrap();
    let task_id = hive
        .submit(json!({"task_type": "flaky", "payload": {}, "max_attempts": 2}))
        .await
        .unwrap();
    let mut node = Node::join(hive.gateway).await.unwrap();

    for attempt in 1..=2 {
        let assign = node.expect("assign").await.unwrap();
        assert_eq!(assign["attempt"], attempt);
        node.send(json!({
            "type": "result",
            "task_id": task_id,
            "attempt": attempt,
            "status": "failure",
            "payload": {"error": "out of memory"},
        }))
        .await
        .unwrap();
        assert_eq!(node.expect("result_ack").await.unwrap()["accepted"], true);
    }

    let task = hive.wait_for_task_state(&task_id, "FAILED").await.unwrap();
    assert_eq!(task["attempt_count"], 2);
    assert!(task["last_error"].as_str().unwrap().contains("out of memory"));
}

/// A node that drops its connection mid-task loses the task to the next node.
#[tokio::test]
async fn test_task_moves_to_another_node_after_disconnect() {
    let hive = Hive::start(fast_config()).await.unwrap();
    let task_id = hive
        .submit(json!({"task_type": "transcode", "payload": {}, "max_attempts": 3}))
        .await
        .unwrap();

    let mut n1 = Node::join(hive.gateway).await.unwrap();
    let assign = n1.expect("assign").await.unwrap();
    assert_eq!(assign["task_id"], task_id.as_str());
    n1.ack(&assign).await.unwrap();
    hive.wait_for_task_state(&task_id, "RUNNING").await.unwrap();

    let (n1_id, n1_token) = (n1.node_id.clone(), n1.token.clone());
    n1.close().await.unwrap();
    hive.wait_for_node_state(&n1_id, "DISCONNECTED").await.unwrap();

    let mut n2 = Node::join(hive.gateway).await.unwrap();
    let retry = n2.expect("assign").await.unwrap();
    assert_eq!(retry["task_id"], task_id.as_str());
    assert_eq!(retry["attempt"], 2);

    // n1 comes back and reports the old attempt: discarded.
    let mut back = Node::rejoin(hive.gateway, &n1_id, &n1_token).await.unwrap();
    back.send(json!({
        "type": "result",
        "task_id": task_id,
        "attempt": 1,
        "status": "success",
        "payload": {},
    }))
    .await
    .unwrap();
    assert_eq!(back.expect("result_ack").await.unwrap()["accepted"], false);

    n2.succeed(&retry, json!({"ok": true})).await.unwrap();
    let done = hive.wait_for_task_state(&task_id, "SUCCEEDED").await.unwrap();
    assert_eq!(done["assigned_node_id"], n2.node_id.as_str());
}

/// A node that goes silent without closing is expired by the stale sweep;
/// its task is requeued and picked up by a second node.
#[tokio::test]
async fn test_stale_node_task_requeued() {
    let mut config = fast_config();
    config.sessions.stale_after_secs = 1;
    let hive = Hive::start(config).await.unwrap();
    let task_id = hive
        .submit(json!({"task_type": "render", "payload": {}, "max_attempts": 2}))
        .await
        .unwrap();

    let mut n1 = Node::join(hive.gateway).await.unwrap();
    let assign = n1.expect("assign").await.unwrap();
    assert_eq!(assign["task_id"], task_id.as_str());

    // n1 now says nothing. n2 keeps heartbeating while it waits.
    let mut n2 = Node::join(hive.gateway).await.unwrap();
    let retry = n2.expect("assign").await.unwrap();
    assert_eq!(retry["task_id"], task_id.as_str());
    assert_eq!(retry["attempt"], 2);

    let info = hive.node(&n1.node_id).await.unwrap();
    assert_eq!(info["state"], "DISCONNECTED");
    assert_eq!(info["connected"], false);
}

/// An assigned node that never answers: with one attempt allowed the task
/// fails on timeout and is not offered again.
#[tokio::test]
async fn test_unanswered_task_fails_on_timeout() {
    let mut config = fast_config();
    config.dispatch.task_timeout_secs = 1;
    let hive = Hive::start(config).await.unwrap();
    let task_id = hive
        .submit(json!({"task_type": "slow", "payload": {}, "max_attempts": 1}))
        .await
        .unwrap();

    let mut node = Node::join(hive.gateway).await.unwrap();
    let assign = node.expect("assign").await.unwrap();
    assert_eq!(assign["task_id"], task_id.as_str());

    let task = hive.wait_for_task_state(&task_id, "FAILED").await.unwrap();
    assert_eq!(task["attempt_count"], 1);

    let info = hive.wait_for_node_state(&node.node_id, "IDLE").await.unwrap();
    assert!(info["current_task_id"].is_null());
    let again = tokio::time::timeout(Duration::from_millis(300), node.expect("assign")).await;
    assert!(again.is_err());
}

/// Asking for work with nothing queued gets an explicit answer.
#[tokio::test]
async fn test_request_task_on_empty_queue() {
    let hive = Hive::start(fast_config()).await.unwrap();
    let mut node = Node::join(hive.gateway).await.unwrap();
    hive.wait_for_node_state(&node.node_id, "IDLE").await.unwrap();

    node.send(json!({"type": "request_task"})).await.unwrap();
    node.expect("no_tasks").await.unwrap();
}

// ── Control API ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_submit_validation() {
    let hive = Hive::start(fast_config()).await.unwrap();

    let (status, _) = hive
        .post("/submit_task", &json!({"task_type": "", "payload": {}}))
        .await
        .unwrap();
    assert_eq!(status, 400);

    let (status, _) = hive
        .post("/submit_task", &json!({"payload": {}}))
        .await
        .unwrap();
    assert_eq!(status, 400);

    let (status, _) = hive
        .post("/submit_task", &json!({"task_type": "x", "deadline_secs": 0}))
        .await
        .unwrap();
    assert_eq!(status, 400);

    let resp = reqwest::get(format!("http://{}/api/task/does-not-exist", hive.api))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn test_full_queue_returns_429() {
    let mut config = fast_config();
    config.queue.capacity = 2;
    let hive = Hive::start(config).await.unwrap();

    hive.submit(json!({"task_type": "a"})).await.unwrap();
    hive.submit(json!({"task_type": "b"})).await.unwrap();
    let (status, body) = hive
        .post("/submit_task", &json!({"task_type": "c"}))
        .await
        .unwrap();
    assert_eq!(status, 429);
    assert!(body.contains("full"));

    let status = hive.get("/status").await.unwrap();
    assert_eq!(status["tasks"]["pending"], 2);
    assert_eq!(status["queue_capacity"], 2);

    let pending = hive.get("/tasks?state=PENDING").await.unwrap();
    assert_eq!(pending["tasks"].as_array().unwrap().len(), 2);
}

/// A PENDING task past its deadline expires without being assigned.
#[tokio::test]
async fn test_deadline_expires_pending_task() {
    let hive = Hive::start(fast_config()).await.unwrap();
    let task_id = hive
        .submit(json!({"task_type": "report", "deadline_secs": 1}))
        .await
        .unwrap();
    let task = hive.wait_for_task_state(&task_id, "EXPIRED").await.unwrap();
    assert_eq!(task["attempt_count"], 0);
}
