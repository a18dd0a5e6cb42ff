//! /status and /health handlers.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use hive_services::{HealthCounts, NodeCounts, TaskCounts};

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub nodes: NodeCounts,
    pub registration: RegistrationInfo,
    pub tasks: TaskCounts,
    pub queue_capacity: usize,
}

#[derive(Serialize)]
pub struct RegistrationInfo {
    /// No backend configured; nodes are promoted without registration.
    pub standalone: bool,
    pub backends: Vec<&'static str>,
    pub health: HealthCounts,
    /// Per backend, keyed "kubernetes" / "slurm".
    pub clusters: BTreeMap<&'static str, ClusterInfo>,
}

#[derive(Serialize)]
pub struct ClusterInfo {
    pub registered_nodes: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let registration = RegistrationInfo {
        standalone: state.registrar.is_standalone(),
        backends: state
            .registrar
            .backend_kinds()
            .into_iter()
            .map(|k| k.as_str())
            .collect(),
        health: state.registrar.health_counts(),
        clusters: state
            .registrar
            .registered_counts()
            .into_iter()
            .map(|(kind, registered_nodes)| (kind.as_str(), ClusterInfo { registered_nodes }))
            .collect(),
    };

    Json(StatusResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        nodes: state.registry.counts(),
        registration,
        tasks: state.queue.counts(),
        queue_capacity: state.queue.capacity(),
    })
}

// ── /health ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" while some live node is registered nowhere.
    pub status: &'static str,
    pub nodes_connected: usize,
    pub degraded_nodes: usize,
}

pub async fn handle_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let counts = state.registry.counts();
    let degraded = state.registrar.health_counts().degraded;
    Json(HealthResponse {
        status: if degraded == 0 { "ok" } else { "degraded" },
        nodes_connected: counts.registering + counts.idle + counts.busy + counts.connecting,
        degraded_nodes: degraded,
    })
}
