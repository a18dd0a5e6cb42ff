//! Gateway wire protocol — JSON messages, one per WebSocket text frame.
//!
//! Every message is an object discriminated by `type`. Unknown fields are
//! ignored so older coordinators accept newer agents.

use serde::{Deserialize, Serialize};

use crate::types::{Capability, NodeId, TaskId};

/// Largest frame the gateway accepts from a node.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

// ── Node → Coordinator ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeMessage {
    /// First frame on every connection. `node_id` and `token` are present
    /// when the node has been welcomed before.
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<NodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        capability: Capability,
    },
    Heartbeat {},
    /// Receipt of an `assign`; the task is now running on the node.
    Ack { task_id: TaskId, attempt: u32 },
    Result {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attempt: Option<u32>,
        status: ResultStatus,
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// The node has capacity and asks for work now.
    RequestTask {},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

// ── Coordinator → Node ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    Welcome {
        node_id: NodeId,
        token: String,
        heartbeat_interval_secs: u64,
    },
    Assign {
        task_id: TaskId,
        task_type: String,
        payload: serde_json::Value,
        priority: i32,
        attempt: u32,
    },
    /// Sent when no node message arrived within the heartbeat interval.
    Ping {},
    ResultAck { task_id: TaskId, accepted: bool },
    /// Answer to `request_task` when nothing is pending.
    NoTasks {},
    /// Outcome of registering the node with one external scheduler.
    Registration {
        backend: String,
        registered: bool,
        message: String,
    },
    Error { message: String },
}

// ── Codec ─────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn decode_node_message(text: &str) -> Result<NodeMessage, ProtocolError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

pub fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}
