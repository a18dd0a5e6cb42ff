//! HTTP API handlers — exposes coordinator state as JSON.

pub mod nodes;
pub mod status;
pub mod tasks;

use std::time::Instant;

use axum::http::StatusCode;

use hive_core::CoordError;
use hive_services::{ClusterRegistrar, Dispatcher, SessionRegistry, TaskQueue};

#[derive(Clone)]
pub struct ApiState {
    pub registry: SessionRegistry,
    pub queue: TaskQueue,
    pub dispatcher: Dispatcher,
    pub registrar: ClusterRegistrar,
    /// `max_attempts` for submissions that leave it out.
    pub default_max_attempts: u32,
    pub started_at: Instant,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Map a coordinator error onto the status callers see.
fn error_response(e: CoordError) -> (StatusCode, String) {
    let status = match &e {
        CoordError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
        CoordError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        CoordError::UnknownTask(_) | CoordError::UnknownNode(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

// Re-export handler functions for use in router setup.
pub use nodes::handle_nodes;
pub use status::{handle_health, handle_status};
pub use tasks::{handle_submit_task, handle_task, handle_tasks};
