//! Batch-scheduler backend: node records pushed to a Slurm control
//! endpoint.
//!
//! Requests are signed with a BLAKE3 keyed hash over
//! `method \n path?query \n timestamp \n body` under the 32-byte credential
//! shared with the controller.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;

use hive_core::config::SlurmSettings;
use hive_core::types::now_ms;
use hive_core::NodeId;

use crate::backend::{BackendError, BackendKind, NodeDescriptor, RegistrationBackend};

pub const TIMESTAMP_HEADER: &str = "X-Hive-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Hive-Signature";

const RETIRE_REASON: &str = "retired by hive coordinator";

#[derive(Debug, Serialize)]
struct NodeRecord<'a> {
    node_name: &'a str,
    cpus: u32,
    real_memory_mb: u64,
    features: Vec<String>,
    partition: &'a str,
    state: &'a str,
}

pub struct SlurmBackend {
    client: reqwest::Client,
    base: String,
    key: [u8; 32],
    partition: String,
}

/// Hex signature for one request.
pub fn sign(key: &[u8; 32], method: &str, path: &str, timestamp: u64, body: &[u8]) -> String {
    let mut h = blake3::Hasher::new_keyed(key);
    h.update(method.as_bytes());
    h.update(b"\n");
    h.update(path.as_bytes());
    h.update(b"\n");
    h.update(timestamp.to_string().as_bytes());
    h.update(b"\n");
    h.update(body);
    h.finalize().to_hex().to_string()
}

fn signed_path(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

impl SlurmBackend {
    pub fn new(settings: &SlurmSettings, timeout: Duration) -> Result<Self, BackendError> {
        let bytes = hex::decode(settings.shared_key.trim())
            .map_err(|e| BackendError::Protocol(format!("slurm shared key: {e}")))?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| BackendError::Protocol(format!("slurm shared key must be 32 bytes, got {}", bytes.len())))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Protocol(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base: settings.control_url.trim_end_matches('/').to_string(),
            key,
            partition: settings.partition.clone(),
        })
    }

    fn node_url(&self, node_id: &NodeId) -> Result<Url, BackendError> {
        let raw = format!("{}/nodes/{}", self.base, node_id.as_str());
        Url::parse(&raw).map_err(|e| BackendError::Protocol(format!("{raw}: {e}")))
    }

    async fn send(&self, method: Method, url: Url, body: Vec<u8>) -> Result<StatusCode, BackendError> {
        let ts = now_ms();
        let sig = sign(&self.key, method.as_str(), &signed_path(&url), ts, &body);
        let mut req = self
            .client
            .request(method, url)
            .header(TIMESTAMP_HEADER, ts.to_string())
            .header(SIGNATURE_HEADER, sig);
        if !body.is_empty() {
            req = req.header(reqwest::header::CONTENT_TYPE, "application/json").body(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(status);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(status);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(BackendError::from_status(status, &text))
    }

    fn record<'a>(&'a self, node: &'a NodeDescriptor) -> NodeRecord<'a> {
        let cap = &node.capability;
        let mut features = vec![cap.arch.clone(), cap.device_class.as_str().to_string()];
        features.extend(cap.features.iter().cloned());
        NodeRecord {
            node_name: node.node_id.as_str(),
            cpus: cap.cores,
            real_memory_mb: cap.memory_mb,
            features,
            partition: &self.partition,
            state: "IDLE",
        }
    }
}

#[async_trait]
impl RegistrationBackend for SlurmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::BatchScheduler
    }

    async fn ensure_registered(&self, node: &NodeDescriptor) -> Result<(), BackendError> {
        let url = self.node_url(&node.node_id)?;
        let body = serde_json::to_vec(&self.record(node))
            .map_err(|e| BackendError::Protocol(e.to_string()))?;
        match self.send(Method::PUT, url, body).await? {
            StatusCode::NOT_FOUND => Err(BackendError::Protocol("control endpoint not found".into())),
            _ => Ok(()),
        }
    }

    async fn ensure_deregistered(&self, node_id: &NodeId) -> Result<(), BackendError> {
        let mut url = self.node_url(node_id)?;
        url.query_pairs_mut().append_pair("reason", RETIRE_REASON);
        self.send(Method::DELETE, url, Vec::new()).await?;
        Ok(())
    }
}
