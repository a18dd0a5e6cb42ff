//! External scheduler backends.
//!
//! Each backend mirrors node membership into one external system. Calls are
//! idempotent: registering a node that is already present with the same
//! descriptor succeeds without changing anything.

use std::fmt;

use async_trait::async_trait;

use hive_core::{Capability, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    ContainerOrchestrator,
    BatchScheduler,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::ContainerOrchestrator => "kubernetes",
            BackendKind::BatchScheduler => "slurm",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Connection refused, timeout, 5xx. Worth retrying.
    #[error("network: {0}")]
    Network(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The backend answered with something we did not expect.
    #[error("protocol: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Auth failures and conflicting records will not fix themselves
    /// within one retry budget.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BackendError::Auth(_) | BackendError::Conflict(_))
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = format!("{status}: {}", body.chars().take(200).collect::<String>());
        match status.as_u16() {
            401 | 403 => BackendError::Auth(detail),
            409 => BackendError::Conflict(detail),
            s if s >= 500 => BackendError::Network(detail),
            _ => BackendError::Protocol(detail),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BackendError::Protocol(e.to_string())
        } else {
            BackendError::Network(e.to_string())
        }
    }
}

/// What a backend is told about a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub capability: Capability,
}

impl NodeDescriptor {
    pub fn new(node_id: NodeId, capability: Capability) -> Self {
        Self {
            node_id,
            capability,
        }
    }

    /// External object name. Kubernetes node names must be DNS-1123
    /// subdomains, so anything else becomes '-'.
    pub fn object_name(&self) -> String {
        sanitize_name(self.node_id.as_str())
    }
}

pub(crate) fn sanitize_name(id: &str) -> String {
    let name: String = id
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '.' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();
    name.trim_matches(|c| c == '-' || c == '.').to_string()
}

#[async_trait]
pub trait RegistrationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Make sure the node exists in the external system as described.
    async fn ensure_registered(&self, node: &NodeDescriptor) -> Result<(), BackendError>;

    /// Make sure the node is gone. Absent already counts as success.
    async fn ensure_deregistered(&self, node_id: &NodeId) -> Result<(), BackendError>;
}
