//! /nodes handler.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use hive_services::{RegistrationRecord, SessionSnapshot};

use super::ApiState;

#[derive(Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeInfo>,
}

#[derive(Serialize)]
pub struct NodeInfo {
    #[serde(flatten)]
    pub session: SessionSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<RegistrationRecord>,
}

pub async fn handle_nodes(State(state): State<ApiState>) -> Json<NodesResponse> {
    let nodes = state
        .registry
        .list()
        .into_iter()
        .map(|session| NodeInfo {
            registration: state.registrar.record(&session.node_id),
            session,
        })
        .collect();
    Json(NodesResponse { nodes })
}
