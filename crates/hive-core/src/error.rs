//! Coordinator error taxonomy.
//!
//! Transient failures (`DeliveryFailure`, `RegistrationFailure`) are retried
//! or rolled back inside the component that sees them. State-machine
//! violations (`InvalidTransition`) are always returned to the caller.

use crate::types::{NodeId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// A state-machine violation: a protocol error or a bug. Never coerced.
    #[error("invalid transition: cannot {action} {entity} in state {state}")]
    InvalidTransition {
        entity: String,
        state: String,
        action: &'static str,
    },

    #[error("task queue full ({capacity} live tasks)")]
    QueueFull { capacity: usize },

    #[error("delivery to node {0} failed")]
    DeliveryFailure(NodeId),

    #[error("registration with {backend} failed: {reason}")]
    RegistrationFailure { backend: String, reason: String },

    #[error("task {0} expired before completion")]
    TaskExpired(TaskId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl CoordError {
    pub fn invalid_node(node_id: &NodeId, state: impl std::fmt::Debug, action: &'static str) -> Self {
        CoordError::InvalidTransition {
            entity: format!("node {node_id}"),
            state: format!("{state:?}"),
            action,
        }
    }

    pub fn invalid_task(task_id: &TaskId, state: impl std::fmt::Debug, action: &'static str) -> Self {
        CoordError::InvalidTransition {
            entity: format!("task {}", task_id.short()),
            state: format!("{state:?}"),
            action,
        }
    }
}
