//! Cluster registrar — mirrors node membership into the external schedulers.
//!
//! A node reaching REGISTERING is pushed to every configured backend
//! concurrently. The first success promotes the session to IDLE; the rest
//! finish in the background of the same call. A node no backend accepted
//! stays REGISTERING with `degraded` health and is retried by `resync`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::Notify;

use hive_core::config::RegistrarConfig;
use hive_core::protocol::CoordinatorMessage;
use hive_core::types::now_ms;
use hive_core::{CoordError, NodeId, NodeState};

use crate::backend::{BackendError, BackendKind, NodeDescriptor, RegistrationBackend};
use crate::session::SessionRegistry;

// ── Retry ─────────────────────────────────────────────────────────────────────

/// Exponential backoff: `initial`, `2 × initial`, … capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RegistrarConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    async fn run<F, Fut>(&self, kind: BackendKind, node_id: &NodeId, mut op: F) -> Result<(), BackendError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), BackendError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(backend = %kind, node_id = %node_id, attempt, error = %e, ?delay, "registration attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationHealth {
    /// Registered with every configured backend.
    Healthy,
    /// Registered with some but not all.
    Partial,
    /// No backend accepted the node.
    Degraded,
    Retired,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationRecord {
    pub node_id: NodeId,
    pub container_orchestrator_registered: bool,
    pub batch_scheduler_registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_attempt: Option<u64>,
    pub health: RegistrationHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Capability fingerprint the flags above were earned with.
    #[serde(skip)]
    fingerprint: Option<[u8; 32]>,
}

impl RegistrationRecord {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            container_orchestrator_registered: false,
            batch_scheduler_registered: false,
            last_sync_attempt: None,
            health: RegistrationHealth::Degraded,
            last_error: None,
            fingerprint: None,
        }
    }

    pub fn is_registered(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::ContainerOrchestrator => self.container_orchestrator_registered,
            BackendKind::BatchScheduler => self.batch_scheduler_registered,
        }
    }

    fn set_registered(&mut self, kind: BackendKind, registered: bool) {
        match kind {
            BackendKind::ContainerOrchestrator => self.container_orchestrator_registered = registered,
            BackendKind::BatchScheduler => self.batch_scheduler_registered = registered,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthCounts {
    pub healthy: usize,
    pub partial: usize,
    pub degraded: usize,
    pub retired: usize,
}

/// Result of one `register_node` pass.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOutcome {
    /// Backends that were called, with their final result.
    pub attempted: Vec<(BackendKind, Result<(), BackendError>)>,
    /// Backends skipped because they already hold this exact descriptor.
    pub skipped: Vec<BackendKind>,
    /// At least one backend holds the node, or none is configured.
    pub usable: bool,
    pub promoted: bool,
}

// ── Registrar ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ClusterRegistrar {
    backends: Vec<Arc<dyn RegistrationBackend>>,
    records: Arc<DashMap<NodeId, RegistrationRecord>>,
    in_flight: Arc<DashSet<NodeId>>,
    registry: SessionRegistry,
    retry: RetryPolicy,
    /// Woken whenever a session is promoted to IDLE.
    idle_signal: Arc<Notify>,
}

impl ClusterRegistrar {
    pub fn new(
        registry: SessionRegistry,
        backends: Vec<Arc<dyn RegistrationBackend>>,
        retry: RetryPolicy,
        idle_signal: Arc<Notify>,
    ) -> Self {
        Self {
            backends,
            records: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashSet::new()),
            registry,
            retry,
            idle_signal,
        }
    }

    pub fn backend_kinds(&self) -> Vec<BackendKind> {
        self.backends.iter().map(|b| b.kind()).collect()
    }

    pub fn is_standalone(&self) -> bool {
        self.backends.is_empty()
    }

    /// Register the node's current capability with every backend that does
    /// not already hold it. Promotes a REGISTERING session to IDLE on the
    /// first success.
    pub async fn register_node(&self, node_id: &NodeId) -> Result<RegistrationOutcome, CoordError> {
        let session = self
            .registry
            .snapshot(node_id)
            .ok_or_else(|| CoordError::UnknownNode(node_id.clone()))?;
        if !self.in_flight.insert(node_id.clone()) {
            tracing::debug!(node_id = %node_id, "registration already in progress");
            return Ok(RegistrationOutcome::default());
        }
        let outcome = self.register_inner(NodeDescriptor::new(node_id.clone(), session.capability)).await;
        self.in_flight.remove(node_id);
        Ok(outcome)
    }

    async fn register_inner(&self, desc: NodeDescriptor) -> RegistrationOutcome {
        let node_id = desc.node_id.clone();
        let fingerprint = desc.capability.fingerprint();
        let mut outcome = RegistrationOutcome::default();

        let needed: Vec<Arc<dyn RegistrationBackend>> = {
            let mut record = self
                .records
                .entry(node_id.clone())
                .or_insert_with(|| RegistrationRecord::new(node_id.clone()));
            if record.fingerprint != Some(fingerprint) || record.health == RegistrationHealth::Retired {
                record.container_orchestrator_registered = false;
                record.batch_scheduler_registered = false;
                record.fingerprint = Some(fingerprint);
            }
            record.last_sync_attempt = Some(now_ms());
            self.backends
                .iter()
                .filter(|b| {
                    let held = record.is_registered(b.kind());
                    if held {
                        outcome.skipped.push(b.kind());
                    }
                    !held
                })
                .cloned()
                .collect()
        };

        if needed.is_empty() || !outcome.skipped.is_empty() {
            outcome.usable = true;
            outcome.promoted = self.promote(&node_id);
        }

        let mut calls: FuturesUnordered<_> = needed
            .into_iter()
            .map(|backend| {
                let desc = desc.clone();
                let retry = self.retry.clone();
                async move {
                    let kind = backend.kind();
                    let result = retry
                        .run(kind, &desc.node_id, || backend.ensure_registered(&desc))
                        .await;
                    (kind, result)
                }
            })
            .collect();

        while let Some((kind, result)) = calls.next().await {
            if let Some(mut record) = self.records.get_mut(&node_id) {
                record.set_registered(kind, result.is_ok());
                if let Err(e) = &result {
                    let failure = CoordError::RegistrationFailure {
                        backend: kind.as_str().to_string(),
                        reason: e.to_string(),
                    };
                    record.last_error = Some(failure.to_string());
                }
            }
            let (registered, message) = match &result {
                Ok(()) => {
                    tracing::info!(node_id = %node_id, backend = %kind, "node registered");
                    (true, format!("registered with {kind}"))
                }
                Err(e) => {
                    tracing::warn!(node_id = %node_id, backend = %kind, error = %e, "registration failed");
                    (false, e.to_string())
                }
            };
            let _ = self.registry.send(
                &node_id,
                CoordinatorMessage::Registration {
                    backend: kind.as_str().to_string(),
                    registered,
                    message,
                },
            );
            if registered && !outcome.usable {
                outcome.usable = true;
                outcome.promoted = self.promote(&node_id);
            }
            outcome.attempted.push((kind, result));
        }

        let health = self.refresh_health(&node_id);
        if health == Some(RegistrationHealth::Degraded) {
            tracing::warn!(node_id = %node_id, "no backend accepted node; it stays REGISTERING until resync");
        }
        outcome
    }

    /// REGISTERING → IDLE. Anything else (already idle, disconnected
    /// meanwhile) is left alone.
    fn promote(&self, node_id: &NodeId) -> bool {
        let registering = self
            .registry
            .snapshot(node_id)
            .is_some_and(|s| s.state == NodeState::Registering);
        if !registering {
            return false;
        }
        match self.registry.mark_idle(node_id) {
            Ok(()) => {
                self.idle_signal.notify_one();
                true
            }
            Err(e) => {
                tracing::debug!(node_id = %node_id, error = %e, "promotion skipped");
                false
            }
        }
    }

    fn refresh_health(&self, node_id: &NodeId) -> Option<RegistrationHealth> {
        let mut record = self.records.get_mut(node_id)?;
        let held = self.backends.iter().filter(|b| record.is_registered(b.kind())).count();
        record.health = if held == self.backends.len() {
            RegistrationHealth::Healthy
        } else if held > 0 {
            RegistrationHealth::Partial
        } else {
            RegistrationHealth::Degraded
        };
        if record.health == RegistrationHealth::Healthy {
            record.last_error = None;
        }
        Some(record.health)
    }

    /// Best-effort removal from every backend, one attempt each. Failures
    /// are logged and recorded, never retried.
    ///
    /// Shares the per-node guard with `register_node`. Returns false when a
    /// registration holds it; `resync` picks the node up later. A node that
    /// came back while its objects were being deleted is registered again.
    pub async fn deregister_node(&self, node_id: &NodeId) -> bool {
        if !self.in_flight.insert(node_id.clone()) {
            tracing::debug!(node_id = %node_id, "registration in progress, deregistration deferred");
            return false;
        }

        let results = futures::future::join_all(self.backends.iter().map(|backend| async move {
            (backend.kind(), backend.ensure_deregistered(node_id).await)
        }))
        .await;

        let returned = self
            .registry
            .snapshot(node_id)
            .is_some_and(|s| s.state != NodeState::Retired);
        {
            let mut record = self
                .records
                .entry(node_id.clone())
                .or_insert_with(|| RegistrationRecord::new(node_id.clone()));
            record.fingerprint = None;
            record.last_sync_attempt = Some(now_ms());
            if !returned {
                record.health = RegistrationHealth::Retired;
            }
            for (kind, result) in results {
                match result {
                    Ok(()) => {
                        record.set_registered(kind, false);
                        tracing::info!(node_id = %node_id, backend = %kind, "node deregistered");
                    }
                    Err(e) => {
                        tracing::warn!(node_id = %node_id, backend = %kind, error = %e, "deregistration failed");
                        record.last_error = Some(format!("{kind}: {e}"));
                    }
                }
            }
        }
        self.in_flight.remove(node_id);

        if returned {
            tracing::info!(node_id = %node_id, "node returned during deregistration, registering again");
            self.refresh_health(node_id);
            if let Err(e) = self.register_node(node_id).await {
                tracing::debug!(node_id = %node_id, error = %e, "re-registration skipped");
            }
        }
        true
    }

    /// Retry nodes stuck in REGISTERING, live nodes missing a backend, and
    /// retired nodes whose deregistration was deferred. Returns how many
    /// nodes were attempted.
    pub async fn resync(&self) -> usize {
        let mut targets = self.registry.list_in_state(NodeState::Registering);
        for state in [NodeState::Idle, NodeState::Busy] {
            for node_id in self.registry.list_in_state(state) {
                let incomplete = self.records.get(&node_id).is_some_and(|r| {
                    matches!(r.health, RegistrationHealth::Partial | RegistrationHealth::Retired)
                });
                if incomplete {
                    targets.push(node_id);
                }
            }
        }
        let retiring: Vec<NodeId> = self
            .registry
            .list_in_state(NodeState::Retired)
            .into_iter()
            .filter(|id| {
                self.records
                    .get(id)
                    .map_or(true, |r| r.health != RegistrationHealth::Retired)
            })
            .collect();

        for node_id in &targets {
            if let Err(e) = self.register_node(node_id).await {
                tracing::debug!(node_id = %node_id, error = %e, "resync skipped node");
            }
        }
        for node_id in &retiring {
            self.deregister_node(node_id).await;
        }
        targets.len() + retiring.len()
    }

    pub fn record(&self, node_id: &NodeId) -> Option<RegistrationRecord> {
        self.records.get(node_id).map(|r| r.clone())
    }

    pub fn records(&self) -> Vec<RegistrationRecord> {
        let mut all: Vec<RegistrationRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        all
    }

    /// Records by health. `degraded` only counts nodes that are connected;
    /// a node registered nowhere that has since left degrades nothing.
    pub fn health_counts(&self) -> HealthCounts {
        let mut counts = HealthCounts::default();
        for r in self.records.iter() {
            match r.health {
                RegistrationHealth::Healthy => counts.healthy += 1,
                RegistrationHealth::Partial => counts.partial += 1,
                RegistrationHealth::Degraded => {
                    let live = self
                        .registry
                        .snapshot(&r.node_id)
                        .is_some_and(|s| s.state.is_live());
                    if live {
                        counts.degraded += 1;
                    }
                }
                RegistrationHealth::Retired => counts.retired += 1,
            }
        }
        counts
    }

    /// Nodes each configured backend currently holds, in backend order.
    pub fn registered_counts(&self) -> Vec<(BackendKind, usize)> {
        self.backends
            .iter()
            .map(|b| {
                let kind = b.kind();
                let held = self.records.iter().filter(|r| r.is_registered(kind)).count();
                (kind, held)
            })
            .collect()
    }

    /// Periodically retry stuck registrations until shutdown.
    pub async fn resync_loop(self, interval: Duration, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(interval);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let n = self.resync().await;
                    if n > 0 {
                        tracing::info!(nodes = n, "registration resync pass");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}
