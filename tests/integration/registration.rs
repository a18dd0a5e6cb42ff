use std::sync::Mutex;

use async_trait::async_trait;
use hive_core::NodeId;
use hive_services::{BackendError, BackendKind, NodeDescriptor};

use crate::*;

/// Backend double that records calls and can be told to refuse.
struct Recorder {
    kind: BackendKind,
    refuse: bool,
    registered: Mutex<Vec<String>>,
    deregistered: Mutex<Vec<String>>,
}

impl Recorder {
    fn new(kind: BackendKind, refuse: bool) -> Arc<Self> {
        Arc::new(Self {
            kind,
            refuse,
            registered: Mutex::new(Vec::new()),
            deregistered: Mutex::new(Vec::new()),
        })
    }

    fn registered(&self) -> Vec<String> {
        self.registered.lock().unwrap().clone()
    }

    fn deregistered(&self) -> Vec<String> {
        self.deregistered.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistrationBackend for Recorder {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn ensure_registered(&self, node: &NodeDescriptor) -> Result<(), BackendError> {
        if self.refuse {
            return Err(BackendError::Auth("token rejected".into()));
        }
        self.registered
            .lock()
            .unwrap()
            .push(node.node_id.as_str().to_owned());
        Ok(())
    }

    async fn ensure_deregistered(&self, node_id: &NodeId) -> Result<(), BackendError> {
        self.deregistered
            .lock()
            .unwrap()
            .push(node_id.as_str().to_owned());
        Ok(())
    }
}

/// One backend accepts, one refuses: the node is usable, the node is told
/// about both outcomes, and its record is partial.
#[tokio::test]
async fn test_partial_registration_still_promotes() {
    let k8s = Recorder::new(BackendKind::ContainerOrchestrator, false);
    let slurm = Recorder::new(BackendKind::BatchScheduler, true);
    let hive = Hive::start_with_backends(
        fast_config(),
        vec![
            k8s.clone() as Arc<dyn RegistrationBackend>,
            slurm.clone() as Arc<dyn RegistrationBackend>,
        ],
    )
    .await
    .unwrap();

    let mut node = Node::join(hive.gateway).await.unwrap();
    let mut reports = Vec::new();
    for _ in 0..2 {
        reports.push(node.expect("registration").await.unwrap());
    }
    let ok = reports.iter().find(|r| r["backend"] == "kubernetes").unwrap();
    assert_eq!(ok["registered"], true);
    let refused = reports.iter().find(|r| r["backend"] == "slurm").unwrap();
    assert_eq!(refused["registered"], false);

    let status = hive
        .wait_for("/status", |s| s["registration"]["health"]["partial"] == 1)
        .await
        .unwrap();
    assert_eq!(status["registration"]["standalone"], false);
    let clusters = &status["registration"]["clusters"];
    assert_eq!(clusters["kubernetes"]["registered_nodes"], 1);
    assert_eq!(clusters["slurm"]["registered_nodes"], 0);

    let info = hive.wait_for_node_state(&node.node_id, "IDLE").await.unwrap();
    assert_eq!(info["registration"]["container_orchestrator_registered"], true);
    assert_eq!(info["registration"]["batch_scheduler_registered"], false);
    assert_eq!(info["registration"]["health"], "partial");
    assert_eq!(k8s.registered(), vec![node.node_id.clone()]);
}

/// Every backend refuses: the node stays REGISTERING and gets no work.
#[tokio::test]
async fn test_unregistered_node_gets_no_work() {
    let k8s = Recorder::new(BackendKind::ContainerOrchestrator, true);
    let hive = Hive::start_with_backends(fast_config(), vec![k8s as Arc<dyn RegistrationBackend>])
        .await
        .unwrap();
    hive.submit(json!({"task_type": "x"})).await.unwrap();

    let mut node = Node::join(hive.gateway).await.unwrap();
    let report = node.expect("registration").await.unwrap();
    assert_eq!(report["registered"], false);

    let again = tokio::time::timeout(Duration::from_millis(300), node.expect("assign")).await;
    assert!(again.is_err());
    assert_eq!(hive.node(&node.node_id).await.unwrap()["state"], "REGISTERING");

    let health = hive
        .wait_for("/health", |h| h["status"] == "degraded")
        .await
        .unwrap();
    assert_eq!(health["degraded_nodes"], 1);

    // Once the node is gone it no longer degrades the coordinator.
    let node_id = node.node_id.clone();
    node.close().await.unwrap();
    hive.wait_for_node_state(&node_id, "DISCONNECTED").await.unwrap();
    let health = hive.wait_for("/health", |h| h["status"] == "ok").await.unwrap();
    assert_eq!(health["degraded_nodes"], 0);
}

/// A node that stays away past the grace period is retired and removed
/// from every backend.
#[tokio::test]
async fn test_retired_node_is_deregistered() {
    let mut config = fast_config();
    config.sessions.retire_after_secs = Some(0);
    let k8s = Recorder::new(BackendKind::ContainerOrchestrator, false);
    let hive = Hive::start_with_backends(config, vec![k8s.clone() as Arc<dyn RegistrationBackend>])
        .await
        .unwrap();

    let node = Node::join(hive.gateway).await.unwrap();
    let node_id = node.node_id.clone();
    hive.wait_for_node_state(&node_id, "IDLE").await.unwrap();
    node.close().await.unwrap();

    let info = hive.wait_for_node_state(&node_id, "RETIRED").await.unwrap();
    assert_eq!(info["connected"], false);

    let deadline = tokio::time::Instant::now() + WAIT;
    while k8s.deregistered().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "node never deregistered");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(k8s.deregistered(), vec![node_id]);
}
