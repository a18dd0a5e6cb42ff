use crate::*;

/// hello → welcome → IDLE, and the node shows up in /nodes and /status.
#[tokio::test]
async fn test_node_joins_and_goes_idle() {
    let hive = Hive::start(fast_config()).await.unwrap();
    let node = Node::join(hive.gateway).await.unwrap();
    assert!(!node.node_id.is_empty());
    assert_eq!(node.token.len(), 64);

    let info = hive.wait_for_node_state(&node.node_id, "IDLE").await.unwrap();
    assert_eq!(info["capability"]["arch"], "arm64");
    assert_eq!(info["capability"]["device_class"], "mobile");
    assert_eq!(info["connected"], true);
    assert_eq!(info["reconnects"], 0);

    let status = hive.get("/status").await.unwrap();
    assert_eq!(status["nodes"]["idle"], 1);
    assert_eq!(status["nodes"]["total"], 1);
}

/// Anything but hello as the first frame is refused and the socket closed.
#[tokio::test]
async fn test_first_frame_must_be_hello() {
    let hive = Hive::start(fast_config()).await.unwrap();
    let mut ws = connect(hive.gateway).await.unwrap();
    ws.send(Message::text(json!({"type": "heartbeat"}).to_string()))
        .await
        .unwrap();

    let reply = next_json(&mut ws).await.unwrap().unwrap();
    assert_eq!(reply["type"], "error");
    assert!(next_json(&mut ws).await.unwrap().is_none());

    let status = hive.get("/status").await.unwrap();
    assert_eq!(status["nodes"]["total"], 0);
}

/// A hello with an unusable capability is refused.
#[tokio::test]
async fn test_invalid_capability_rejected() {
    let hive = Hive::start(fast_config()).await.unwrap();
    let mut ws = connect(hive.gateway).await.unwrap();
    let hello = json!({
        "type": "hello",
        "capability": {"arch": "arm64", "cores": 0, "memory_mb": 512, "device_class": "mobile"},
    });
    ws.send(Message::text(hello.to_string())).await.unwrap();

    let reply = next_json(&mut ws).await.unwrap().unwrap();
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().contains("cores"));
}

/// A connection that never says hello is closed after the handshake timeout.
#[tokio::test]
async fn test_silent_connection_times_out() {
    let hive = Hive::start(fast_config()).await.unwrap();
    let mut ws = connect(hive.gateway).await.unwrap();

    let reply = tokio::time::timeout(WAIT, next_json(&mut ws))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "handshake timeout");
}

/// Reconnecting with the issued token resumes the same session.
#[tokio::test]
async fn test_reconnect_with_token_keeps_identity() {
    let hive = Hive::start(fast_config()).await.unwrap();
    let node = Node::join(hive.gateway).await.unwrap();
    let (node_id, token) = (node.node_id.clone(), node.token.clone());
    hive.wait_for_node_state(&node_id, "IDLE").await.unwrap();

    node.close().await.unwrap();
    let info = hive.wait_for_node_state(&node_id, "DISCONNECTED").await.unwrap();
    assert_eq!(info["connected"], false);

    let back = Node::rejoin(hive.gateway, &node_id, &token).await.unwrap();
    assert_eq!(back.node_id, node_id);
    assert_eq!(back.token, token);

    let info = hive.wait_for_node_state(&node_id, "IDLE").await.unwrap();
    assert_eq!(info["reconnects"], 1);
    assert_eq!(hive.get("/status").await.unwrap()["nodes"]["total"], 1);
}

/// A token issued for a different id does not hijack that id.
#[tokio::test]
async fn test_forged_token_gets_fresh_identity() {
    let hive = Hive::start(fast_config()).await.unwrap();
    let victim = Node::join(hive.gateway).await.unwrap();
    let other = Node::join(hive.gateway).await.unwrap();

    let impostor = Node::rejoin(hive.gateway, &victim.node_id, &other.token)
        .await
        .unwrap();
    assert_ne!(impostor.node_id, victim.node_id);
    assert_ne!(impostor.node_id, other.node_id);

    hive.wait_for("/status", |s| s["nodes"]["total"] == 3)
        .await
        .unwrap();
}

/// Two hellos for the same node: the second connection takes over, the
/// first is closed, and there is still exactly one session, still live.
#[tokio::test]
async fn test_second_hello_takes_over_session() {
    let hive = Hive::start(fast_config()).await.unwrap();
    let mut first = Node::join(hive.gateway).await.unwrap();
    hive.wait_for_node_state(&first.node_id, "IDLE").await.unwrap();

    let mut second = Node::rejoin(hive.gateway, &first.node_id, &first.token)
        .await
        .unwrap();
    assert_eq!(second.node_id, first.node_id);

    let seen = first.expect_closed().await.unwrap();
    assert!(seen.iter().any(|m| m["type"] == "error"));

    // The old connection's teardown must not disconnect the session.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let info = hive.node(&second.node_id).await.unwrap();
    assert_eq!(info["state"], "IDLE");
    assert_eq!(info["connected"], true);
    assert_eq!(hive.get("/status").await.unwrap()["nodes"]["total"], 1);

    // Work now flows over the new connection.
    let task_id = hive
        .submit(json!({"task_type": "echo", "payload": {"n": 1}}))
        .await
        .unwrap();
    let assign = second.expect("assign").await.unwrap();
    assert_eq!(assign["task_id"], task_id.as_str());
}

/// A frame over the 1 MiB limit is refused by the transport and the node
/// is dropped.
#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let hive = Hive::start(fast_config()).await.unwrap();
    let mut node = Node::join(hive.gateway).await.unwrap();
    hive.wait_for_node_state(&node.node_id, "IDLE").await.unwrap();

    let padding = "x".repeat(1024 * 1024 + 1);
    // The coordinator may reset the socket mid-write.
    let _ = node.send(json!({"type": "heartbeat", "padding": padding})).await;
    node.expect_closed().await.unwrap();

    let info = hive.wait_for_node_state(&node.node_id, "DISCONNECTED").await.unwrap();
    assert_eq!(info["connected"], false);
}
