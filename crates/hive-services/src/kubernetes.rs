//! Container-orchestrator backend: a Node object per compute node, created
//! through the Kubernetes core API.
//!
//! Nodes are tainted `hive.io/edge-node=true:NoSchedule` so only workloads
//! that tolerate intermittent edge hardware land on them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};

use hive_core::config::KubernetesSettings;
use hive_core::NodeId;

use crate::backend::{sanitize_name, BackendError, BackendKind, NodeDescriptor, RegistrationBackend};

pub const EDGE_TAINT_KEY: &str = "hive.io/edge-node";

pub struct KubernetesBackend {
    client: reqwest::Client,
    api_url: String,
    token: String,
    max_pods: u32,
}

impl KubernetesBackend {
    pub fn new(settings: &KubernetesSettings, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Protocol(format!("http client: {e}")))?;
        Ok(Self {
            client,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            max_pods: settings.max_pods,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.client.request(method, format!("{}{}", self.api_url, path));
        if self.token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.token)
        }
    }

    /// The Node object we want the API server to hold for `node`.
    pub fn manifest(&self, node: &NodeDescriptor) -> Value {
        let cap = &node.capability;
        let class = cap.device_class.as_str();

        let mut labels = serde_json::Map::new();
        labels.insert("node-type".into(), json!(class));
        labels.insert("cluster-role".into(), json!("compute"));
        labels.insert("hive.io/device-class".into(), json!(class));
        labels.insert("kubernetes.io/arch".into(), json!(cap.arch));
        for feature in &cap.features {
            let key = sanitize_name(feature);
            if !key.is_empty() {
                labels.insert(format!("hive.io/feature-{key}"), json!("true"));
            }
        }

        // Leave one core and a quarter of memory to the device itself.
        let alloc_cpu = cap.cores.saturating_sub(1).max(1);
        let alloc_mem = (cap.memory_mb * 3 / 4).max(1);

        json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {
                "name": node.object_name(),
                "labels": labels,
            },
            "spec": {
                "taints": [{
                    "key": EDGE_TAINT_KEY,
                    "value": "true",
                    "effect": "NoSchedule",
                }],
            },
            "status": {
                "nodeInfo": { "architecture": cap.arch },
                "capacity": {
                    "cpu": cap.cores.to_string(),
                    "memory": format!("{}Mi", cap.memory_mb),
                    "pods": self.max_pods.to_string(),
                },
                "allocatable": {
                    "cpu": alloc_cpu.to_string(),
                    "memory": format!("{alloc_mem}Mi"),
                    "pods": self.max_pods.to_string(),
                },
            },
        })
    }

    async fn fetch(&self, name: &str) -> Result<Value, BackendError> {
        let resp = self
            .request(Method::GET, &format!("/api/v1/nodes/{name}"))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, &body));
        }
        Ok(resp.json().await?)
    }

    async fn replace(&self, name: &str, mut desired: Value, existing: &Value) -> Result<(), BackendError> {
        // Replace is optimistic-concurrency checked against the stored version.
        if let Some(rv) = existing.pointer("/metadata/resourceVersion") {
            desired["metadata"]["resourceVersion"] = rv.clone();
        }
        let resp = self
            .request(Method::PUT, &format!("/api/v1/nodes/{name}"))
            .json(&desired)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BackendError::from_status(status, &body))
    }
}

/// Same labels and capacity: the stored object already describes the node.
fn same_node(existing: &Value, desired: &Value) -> bool {
    existing.pointer("/metadata/labels") == desired.pointer("/metadata/labels")
        && existing.pointer("/status/capacity") == desired.pointer("/status/capacity")
}

#[async_trait]
impl RegistrationBackend for KubernetesBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ContainerOrchestrator
    }

    async fn ensure_registered(&self, node: &NodeDescriptor) -> Result<(), BackendError> {
        let name = node.object_name();
        let desired = self.manifest(node);

        let resp = self
            .request(Method::POST, "/api/v1/nodes")
            .json(&desired)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            tracing::debug!(node_id = %node.node_id, name = %name, "kubernetes node created");
            return Ok(());
        }
        if status != StatusCode::CONFLICT {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, &body));
        }

        let existing = self.fetch(&name).await?;
        if same_node(&existing, &desired) {
            return Ok(());
        }
        tracing::info!(node_id = %node.node_id, name = %name, "kubernetes node differs, replacing");
        self.replace(&name, desired, &existing).await
    }

    async fn ensure_deregistered(&self, node_id: &NodeId) -> Result<(), BackendError> {
        let name = sanitize_name(node_id.as_str());
        let resp = self
            .request(Method::DELETE, &format!("/api/v1/nodes/{name}"))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BackendError::from_status(status, &body))
    }
}
