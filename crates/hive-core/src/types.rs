//! Identifiers, capability descriptors and lifecycle states shared by every
//! Hive component.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Stable node identity. Issued on first registration and kept across
/// reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh random identity, e.g. `node-3fa94c0e21d7`.
    pub fn generate() -> Self {
        let bytes: [u8; 6] = rand::random();
        Self(format!("node-{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque task identifier, generated at submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a task id from the submission sequence number, submission time
    /// and payload bytes. The sequence number makes ids unique even for
    /// identical payloads submitted in the same millisecond.
    pub fn derive(seq: u64, submitted_at: u64, payload: &[u8]) -> Self {
        let mut h = blake3::Hasher::new();
        h.update(&seq.to_le_bytes());
        h.update(&submitted_at.to_le_bytes());
        h.update(payload);
        Self(hex::encode(&h.finalize().as_bytes()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Capability ────────────────────────────────────────────────────────────────

/// Declared class of a compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Phones and tablets. Expect frequent disconnects.
    Mobile,
    /// Small ARM boards and similar always-on edge hardware.
    Edge,
    /// Conventional servers and workstations.
    Fixed,
}

impl DeviceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Edge => "edge",
            DeviceClass::Fixed => "fixed",
        }
    }
}

/// What a node reports about itself in `hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// CPU architecture, e.g. "arm64", "x86_64".
    pub arch: String,
    pub cores: u32,
    pub memory_mb: u64,
    pub device_class: DeviceClass,
    /// Free-form feature tags, e.g. "gpu", "nnapi".
    #[serde(default)]
    pub features: Vec<String>,
}

impl Capability {
    /// Reject descriptors no scheduler could use.
    pub fn validate(&self) -> Result<(), String> {
        if self.arch.trim().is_empty() {
            return Err("capability.arch must not be empty".to_string());
        }
        if self.cores == 0 {
            return Err("capability.cores must be at least 1".to_string());
        }
        if self.memory_mb == 0 {
            return Err("capability.memory_mb must be at least 1".to_string());
        }
        Ok(())
    }

    /// BLAKE3 fingerprint of the descriptor. Two registrations with the same
    /// fingerprint describe the same external node object.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut h = blake3::Hasher::new();
        h.update(self.arch.as_bytes());
        h.update(&self.cores.to_le_bytes());
        h.update(&self.memory_mb.to_le_bytes());
        h.update(self.device_class.as_str().as_bytes());
        let mut features = self.features.clone();
        features.sort();
        for f in &features {
            h.update(&[0]);
            h.update(f.as_bytes());
        }
        *h.finalize().as_bytes()
    }
}

// ── Lifecycle states ──────────────────────────────────────────────────────────

/// Node session lifecycle.
///
/// CONNECTING → REGISTERING → IDLE ⇄ BUSY → DISCONNECTED → {CONNECTING | RETIRED}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Connecting,
    Registering,
    Idle,
    Busy,
    Disconnected,
    Retired,
}

impl NodeState {
    /// Connected and not yet given up on.
    pub fn is_live(self) -> bool {
        !matches!(self, NodeState::Disconnected | NodeState::Retired)
    }
}

/// Task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Expired,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Expired
        )
    }

    /// Held by a node right now.
    pub fn is_outstanding(self) -> bool {
        matches!(self, TaskState::Assigned | TaskState::Running)
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
