//! Session registry — one entry per node that has ever said `hello`.
//!
//! Sessions are never removed on disconnect. The connection handle is
//! cleared and the session waits in DISCONNECTED so a reconnecting node
//! resumes the same identity. Each entry is locked independently
//! (DashMap shard lock), which serialises all operations on one node.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use hive_core::protocol::CoordinatorMessage;
use hive_core::types::now_ms;
use hive_core::{Capability, CoordError, NodeId, NodeState, TaskId};

/// Outbound side of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Gateway-assigned id, unique per accepted connection.
    pub conn_id: u64,
    pub remote: SocketAddr,
    tx: mpsc::UnboundedSender<CoordinatorMessage>,
}

impl ConnectionHandle {
    pub fn new(
        conn_id: u64,
        remote: SocketAddr,
        tx: mpsc::UnboundedSender<CoordinatorMessage>,
    ) -> Self {
        Self { conn_id, remote, tx }
    }

    /// Queue a message for the connection's writer. False once the
    /// connection has gone away.
    pub fn send(&self, msg: CoordinatorMessage) -> bool {
        self.tx.send(msg).is_ok()
    }
}

#[derive(Debug)]
struct NodeSession {
    node_id: NodeId,
    capability: Capability,
    state: NodeState,
    connection: Option<ConnectionHandle>,
    last_heartbeat: Instant,
    current_task_id: Option<TaskId>,
    /// Unix ms of the first registration of this session object.
    first_seen: u64,
    /// Unix ms the current (or last) connection was attached.
    connected_at: Option<u64>,
    disconnected_at: Option<Instant>,
    reconnects: u32,
    tasks_completed: u64,
}

impl NodeSession {
    fn new(node_id: NodeId, capability: Capability) -> Self {
        Self {
            node_id,
            capability,
            state: NodeState::Connecting,
            connection: None,
            last_heartbeat: Instant::now(),
            current_task_id: None,
            first_seen: now_ms(),
            connected_at: None,
            disconnected_at: None,
            reconnects: 0,
            tasks_completed: 0,
        }
    }

    /// Drop the connection and keep the outstanding task id until it is
    /// resolved.
    fn disconnect(&mut self, now: Instant) -> Option<TaskId> {
        self.state = NodeState::Disconnected;
        self.connection = None;
        self.disconnected_at = Some(now);
        self.current_task_id.clone()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            node_id: self.node_id.clone(),
            state: self.state,
            capability: self.capability.clone(),
            connected: self.connection.is_some(),
            remote: self.connection.as_ref().map(|c| c.remote.to_string()),
            last_heartbeat_secs: self.last_heartbeat.elapsed().as_secs(),
            current_task_id: self.current_task_id.clone(),
            first_seen: self.first_seen,
            connected_at: self.connected_at,
            reconnects: self.reconnects,
            tasks_completed: self.tasks_completed,
        }
    }
}

/// Read-only copy of a session, safe to hold across awaits.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub node_id: NodeId,
    pub state: NodeState,
    pub capability: Capability,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    pub last_heartbeat_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<TaskId>,
    pub first_seen: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<u64>,
    pub reconnects: u32,
    pub tasks_completed: u64,
}

/// Session counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeCounts {
    pub total: usize,
    pub connecting: usize,
    pub registering: usize,
    pub idle: usize,
    pub busy: usize,
    pub disconnected: usize,
    pub retired: usize,
}

/// Result of tearing down a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detach {
    /// The connection had already been replaced by a newer one; the session
    /// was left alone.
    Superseded,
    /// The session is now DISCONNECTED, holding this outstanding task.
    Disconnected(Option<TaskId>),
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<NodeId, NodeSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Create or revive the session for `node_id`.
    ///
    /// Unseen → CONNECTING. DISCONNECTED → CONNECTING with history kept.
    /// RETIRED → a fresh session under the same id. Any other state is left
    /// as is, so retries are harmless.
    pub fn register(&self, node_id: &NodeId, capability: Capability) -> SessionSnapshot {
        match self.sessions.entry(node_id.clone()) {
            Entry::Vacant(v) => {
                tracing::info!(node_id = %node_id, class = capability.device_class.as_str(), "new node session");
                v.insert(NodeSession::new(node_id.clone(), capability)).snapshot()
            }
            Entry::Occupied(mut o) => {
                let session = o.get_mut();
                match session.state {
                    NodeState::Disconnected => {
                        session.state = NodeState::Connecting;
                        session.reconnects += 1;
                        session.disconnected_at = None;
                        session.last_heartbeat = Instant::now();
                        session.capability = capability;
                        tracing::info!(node_id = %node_id, reconnects = session.reconnects, "node reconnecting");
                    }
                    NodeState::Retired => {
                        *session = NodeSession::new(node_id.clone(), capability);
                        tracing::info!(node_id = %node_id, "retired node returned, new session");
                    }
                    _ => {
                        session.capability = capability;
                    }
                }
                session.snapshot()
            }
        }
    }

    /// Install the connection for a registered node. Returns the connection
    /// it replaces, if any (takeover). CONNECTING advances to REGISTERING.
    pub fn attach(
        &self,
        node_id: &NodeId,
        handle: ConnectionHandle,
    ) -> Result<Option<ConnectionHandle>, CoordError> {
        let mut session = self
            .sessions
            .get_mut(node_id)
            .ok_or_else(|| CoordError::UnknownNode(node_id.clone()))?;
        if !session.state.is_live() {
            return Err(CoordError::invalid_node(node_id, session.state, "attach a connection to"));
        }
        let old = session.connection.replace(handle);
        session.connected_at = Some(now_ms());
        if session.state == NodeState::Connecting {
            session.state = NodeState::Registering;
        }
        session.last_heartbeat = Instant::now();
        Ok(old)
    }

    pub fn heartbeat(&self, node_id: &NodeId) -> Result<(), CoordError> {
        let mut session = self
            .sessions
            .get_mut(node_id)
            .ok_or_else(|| CoordError::UnknownNode(node_id.clone()))?;
        if !session.state.is_live() {
            return Err(CoordError::invalid_node(node_id, session.state, "heartbeat"));
        }
        session.last_heartbeat = Instant::now();
        Ok(())
    }

    /// REGISTERING → IDLE. A BUSY session must have its task resolved first.
    pub fn mark_idle(&self, node_id: &NodeId) -> Result<(), CoordError> {
        let mut session = self
            .sessions
            .get_mut(node_id)
            .ok_or_else(|| CoordError::UnknownNode(node_id.clone()))?;
        match session.state {
            NodeState::Registering | NodeState::Idle => {
                session.state = NodeState::Idle;
                Ok(())
            }
            NodeState::Busy => Err(CoordError::invalid_node(
                node_id,
                session.state,
                "mark idle (resolve its task first)",
            )),
            other => Err(CoordError::invalid_node(node_id, other, "mark idle")),
        }
    }

    /// IDLE → BUSY with `task_id` outstanding.
    pub fn mark_busy(&self, node_id: &NodeId, task_id: &TaskId) -> Result<(), CoordError> {
        let mut session = self
            .sessions
            .get_mut(node_id)
            .ok_or_else(|| CoordError::UnknownNode(node_id.clone()))?;
        if session.state != NodeState::Idle {
            return Err(CoordError::invalid_node(node_id, session.state, "mark busy"));
        }
        session.state = NodeState::Busy;
        session.current_task_id = Some(task_id.clone());
        Ok(())
    }

    /// Any live state → DISCONNECTED. Returns the outstanding task, which the
    /// session keeps until it is requeued or resolved.
    pub fn mark_disconnected(&self, node_id: &NodeId) -> Result<Option<TaskId>, CoordError> {
        let mut session = self
            .sessions
            .get_mut(node_id)
            .ok_or_else(|| CoordError::UnknownNode(node_id.clone()))?;
        match session.state {
            NodeState::Retired => Err(CoordError::invalid_node(node_id, session.state, "disconnect")),
            NodeState::Disconnected => Ok(session.current_task_id.clone()),
            _ => Ok(session.disconnect(Instant::now())),
        }
    }

    /// Disconnect only if `conn_id` is still the session's connection.
    pub fn detach(&self, node_id: &NodeId, conn_id: u64) -> Result<Detach, CoordError> {
        let mut session = self
            .sessions
            .get_mut(node_id)
            .ok_or_else(|| CoordError::UnknownNode(node_id.clone()))?;
        if session.connection.as_ref().map(|c| c.conn_id) != Some(conn_id) {
            return Ok(Detach::Superseded);
        }
        Ok(Detach::Disconnected(session.disconnect(Instant::now())))
    }

    /// Resolve the outstanding task. BUSY → IDLE; a DISCONNECTED session
    /// simply forgets the task.
    pub fn release_task(&self, node_id: &NodeId, task_id: &TaskId) -> Result<(), CoordError> {
        let mut session = self
            .sessions
            .get_mut(node_id)
            .ok_or_else(|| CoordError::UnknownNode(node_id.clone()))?;
        if session.current_task_id.as_ref() != Some(task_id) {
            return Err(CoordError::invalid_node(node_id, session.state, "release a task it does not hold on"));
        }
        session.current_task_id = None;
        if session.state == NodeState::Busy {
            session.state = NodeState::Idle;
        }
        Ok(())
    }

    pub fn note_completed(&self, node_id: &NodeId) {
        if let Some(mut session) = self.sessions.get_mut(node_id) {
            session.tasks_completed += 1;
        }
    }

    /// Idle nodes, each listed once, ordered by id.
    pub fn list_idle(&self) -> Vec<NodeId> {
        self.list_in_state(NodeState::Idle)
    }

    pub fn list_in_state(&self, state: NodeState) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .sessions
            .iter()
            .filter(|e| e.value().state == state)
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Mark live sessions with no heartbeat within `threshold` as
    /// DISCONNECTED. Returns each expired node with its outstanding task.
    pub fn expire_stale(&self, threshold: Duration) -> Vec<(NodeId, Option<TaskId>)> {
        self.expire_stale_at(threshold, Instant::now())
    }

    pub fn expire_stale_at(
        &self,
        threshold: Duration,
        now: Instant,
    ) -> Vec<(NodeId, Option<TaskId>)> {
        let mut expired = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            if !session.state.is_live() {
                continue;
            }
            if now.saturating_duration_since(session.last_heartbeat) > threshold {
                let task = session.disconnect(now);
                tracing::info!(node_id = %session.node_id, task = ?task.as_ref().map(|t| t.short().to_string()), "session expired");
                expired.push((session.node_id.clone(), task));
            }
        }
        expired
    }

    /// DISCONNECTED sessions with no outstanding task that have waited
    /// longer than `grace` become RETIRED.
    pub fn retire_expired(&self, grace: Duration) -> Vec<NodeId> {
        self.retire_expired_at(grace, Instant::now())
    }

    pub fn retire_expired_at(&self, grace: Duration, now: Instant) -> Vec<NodeId> {
        let mut retired = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            if session.state != NodeState::Disconnected || session.current_task_id.is_some() {
                continue;
            }
            let Some(since) = session.disconnected_at else {
                continue;
            };
            if now.saturating_duration_since(since) > grace {
                session.state = NodeState::Retired;
                retired.push(session.node_id.clone());
            }
        }
        retired
    }

    /// Push a message to the node's current connection.
    pub fn send(&self, node_id: &NodeId, msg: CoordinatorMessage) -> Result<(), CoordError> {
        let session = self
            .sessions
            .get(node_id)
            .ok_or_else(|| CoordError::UnknownNode(node_id.clone()))?;
        match &session.connection {
            Some(conn) if conn.send(msg) => Ok(()),
            _ => Err(CoordError::DeliveryFailure(node_id.clone())),
        }
    }

    pub fn snapshot(&self, node_id: &NodeId) -> Option<SessionSnapshot> {
        self.sessions.get(node_id).map(|s| s.snapshot())
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<SessionSnapshot> = self.sessions.iter().map(|e| e.value().snapshot()).collect();
        all.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        all
    }

    pub fn counts(&self) -> NodeCounts {
        let mut counts = NodeCounts::default();
        for entry in self.sessions.iter() {
            counts.total += 1;
            match entry.value().state {
                NodeState::Connecting => counts.connecting += 1,
                NodeState::Registering => counts.registering += 1,
                NodeState::Idle => counts.idle += 1,
                NodeState::Busy => counts.busy += 1,
                NodeState::Disconnected => counts.disconnected += 1,
                NodeState::Retired => counts.retired += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
