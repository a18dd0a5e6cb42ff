//! Dispatcher — pairs idle sessions with pending tasks and resolves
//! everything that touches a session and a task together.
//!
//! Every cross-entity step (assignment, ack, result, disconnect, sweep)
//! runs under one pairing lock, so no two of them interleave. None of them
//! await while holding it; delivery only queues onto the connection's
//! channel.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, Notify};

use hive_core::config::HiveConfig;
use hive_core::protocol::{CoordinatorMessage, ResultStatus};
use hive_core::types::now_ms;
use hive_core::{CoordError, NodeId, TaskId, TaskState};

use crate::queue::TaskQueue;
use crate::session::{Detach, SessionRegistry};

/// Pushes a message to a node. `SessionRegistry` delivers through the
/// node's connection channel.
pub trait Outbound: Send + Sync {
    fn deliver(&self, node_id: &NodeId, msg: CoordinatorMessage) -> Result<(), CoordError>;
}

impl Outbound for SessionRegistry {
    fn deliver(&self, node_id: &NodeId, msg: CoordinatorMessage) -> Result<(), CoordError> {
        self.send(node_id, msg)
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Matching cycle period when nothing triggers it earlier.
    pub interval: Duration,
    pub task_timeout: Duration,
    pub stale_after: Duration,
    pub retire_after: Option<Duration>,
}

impl DispatchSettings {
    pub fn from_config(config: &HiveConfig) -> Self {
        Self {
            interval: config.dispatch.interval(),
            task_timeout: config.dispatch.task_timeout(),
            stale_after: config.sessions.stale_after(),
            retire_after: config.sessions.retire_after(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultOutcome {
    /// Applied; the task is now in this state.
    Accepted(TaskState),
    /// Late, duplicate or from the wrong node. Nothing changed.
    Discarded,
}

/// What one maintenance sweep changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Sessions whose heartbeat went stale.
    pub expired_sessions: Vec<NodeId>,
    /// Outstanding tasks with no node activity within the task timeout.
    pub timed_out: Vec<TaskId>,
    /// Abandoned tasks put back in the queue.
    pub requeued: Vec<TaskId>,
    /// Abandoned tasks that ran out of attempts or passed their deadline.
    pub finished: Vec<TaskId>,
    /// PENDING tasks whose deadline passed.
    pub expired_tasks: Vec<TaskId>,
    /// Sessions retired after the grace period. Deregister these.
    pub retired: Vec<NodeId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_sessions.is_empty()
            && self.timed_out.is_empty()
            && self.expired_tasks.is_empty()
            && self.retired.is_empty()
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: SessionRegistry,
    queue: TaskQueue,
    outbound: Arc<dyn Outbound>,
    pairing: Arc<Mutex<()>>,
    wakeup: Arc<Notify>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        registry: SessionRegistry,
        queue: TaskQueue,
        outbound: Arc<dyn Outbound>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            registry,
            queue,
            outbound,
            pairing: Arc::new(Mutex::new(())),
            wakeup: Arc::new(Notify::new()),
            settings,
        }
    }

    fn pair(&self) -> MutexGuard<'_, ()> {
        self.pairing.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Signal that wakes the dispatch loop early.
    pub fn wakeup(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    /// Request a matching cycle (task submitted, node idle, node asked).
    pub fn notify(&self) {
        self.wakeup.notify_one();
    }

    /// Whether a matching cycle could hand anything out.
    pub fn has_pending(&self) -> bool {
        self.queue.next_pending().is_some()
    }

    // ── Assignment ───────────────────────────────────────────────────────────

    /// One matching pass. Returns the number of tasks handed out.
    pub fn run_cycle(&self) -> usize {
        let _pairing = self.pair();
        let mut assigned = 0;
        for node_id in self.registry.list_idle() {
            let Some(task) = self.queue.next_pending() else {
                break;
            };
            match self.assign(&task.task_id, &node_id) {
                Ok(()) => assigned += 1,
                Err(e) => {
                    tracing::warn!(node_id = %node_id, task_id = task.task_id.short(), error = %e, "assignment rolled back");
                }
            }
        }
        assigned
    }

    fn assign(&self, task_id: &TaskId, node_id: &NodeId) -> Result<(), CoordError> {
        let task = self.queue.mark_assigned(task_id, node_id)?;
        if let Err(e) = self.registry.mark_busy(node_id, task_id) {
            self.rollback_queue(task_id, node_id);
            return Err(e);
        }

        let msg = CoordinatorMessage::Assign {
            task_id: task.task_id.clone(),
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            priority: task.priority,
            attempt: task.attempt_count,
        };
        if let Err(e) = self.outbound.deliver(node_id, msg) {
            // The node never saw it: undo both sides.
            self.rollback_queue(task_id, node_id);
            if let Err(e) = self.registry.release_task(node_id, task_id) {
                tracing::warn!(node_id = %node_id, error = %e, "rollback release failed");
            }
            if let Err(e) = self.registry.mark_disconnected(node_id) {
                tracing::warn!(node_id = %node_id, error = %e, "rollback disconnect failed");
            }
            return Err(e);
        }

        tracing::info!(
            node_id = %node_id,
            task_id = task.task_id.short(),
            task_type = %task.task_type,
            attempt = task.attempt_count,
            "task assigned"
        );
        Ok(())
    }

    fn rollback_queue(&self, task_id: &TaskId, node_id: &NodeId) {
        if let Err(e) = self.queue.unassign(task_id, node_id) {
            tracing::warn!(task_id = task_id.short(), error = %e, "rollback unassign failed");
        }
    }

    // ── Node events ──────────────────────────────────────────────────────────

    /// The node confirmed receipt of an assignment.
    pub fn on_ack(&self, node_id: &NodeId, task_id: &TaskId, attempt: u32) -> Result<(), CoordError> {
        let _pairing = self.pair();
        let task = self.queue.status(task_id)?;
        if task.state == TaskState::Expired {
            return Err(CoordError::TaskExpired(task_id.clone()));
        }
        if task.assigned_node_id.as_ref() != Some(node_id) || task.attempt_count != attempt {
            return Err(CoordError::invalid_task(task_id, task.state, "acknowledge a stale assignment of"));
        }
        match task.state {
            TaskState::Assigned => self.queue.mark_running(task_id),
            TaskState::Running => Ok(()),
            other => Err(CoordError::invalid_task(task_id, other, "acknowledge")),
        }
    }

    /// A node reported the outcome of a task.
    pub fn on_result(
        &self,
        node_id: &NodeId,
        task_id: &TaskId,
        attempt: Option<u32>,
        status: ResultStatus,
        payload: serde_json::Value,
    ) -> Result<ResultOutcome, CoordError> {
        let _pairing = self.pair();
        let Ok(task) = self.queue.status(task_id) else {
            tracing::debug!(node_id = %node_id, task_id = task_id.short(), "result for unknown task");
            return Ok(ResultOutcome::Discarded);
        };
        let current = task.state.is_outstanding()
            && task.assigned_node_id.as_ref() == Some(node_id)
            && attempt.map_or(true, |a| a == task.attempt_count);
        if !current {
            tracing::debug!(
                node_id = %node_id,
                task_id = task_id.short(),
                state = ?task.state,
                "late result discarded"
            );
            return Ok(ResultOutcome::Discarded);
        }

        if task.state == TaskState::Assigned {
            self.queue.mark_running(task_id)?;
        }
        let state = match status {
            ResultStatus::Success => {
                self.queue.complete(task_id, payload)?;
                self.registry.note_completed(node_id);
                TaskState::Succeeded
            }
            ResultStatus::Failure => self.queue.fail(task_id, failure_reason(&payload))?,
        };
        if let Err(e) = self.registry.release_task(node_id, task_id) {
            tracing::warn!(node_id = %node_id, error = %e, "session did not hold resolved task");
        }
        tracing::info!(node_id = %node_id, task_id = task_id.short(), state = ?state, "task result");
        self.notify();
        Ok(ResultOutcome::Accepted(state))
    }

    /// A connection closed. Only disconnects the session if `conn_id` is
    /// still its connection; a held task is abandoned right away.
    pub fn on_disconnect(&self, node_id: &NodeId, conn_id: u64) -> Result<Detach, CoordError> {
        let _pairing = self.pair();
        let detached = self.registry.detach(node_id, conn_id)?;
        if let Detach::Disconnected(Some(task_id)) = &detached {
            let state = self.abandon_held(node_id, task_id, now_ms());
            tracing::info!(node_id = %node_id, task_id = task_id.short(), state = ?state, "task abandoned on disconnect");
            self.notify();
        }
        Ok(detached)
    }

    /// Abandon `task_id` and clear it from the session. Returns the task's
    /// new state, if the abandon applied.
    fn abandon_held(&self, node_id: &NodeId, task_id: &TaskId, now: u64) -> Option<TaskState> {
        let state = match self.queue.abandon_at(task_id, now) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::debug!(task_id = task_id.short(), error = %e, "abandon skipped");
                None
            }
        };
        if let Err(e) = self.registry.release_task(node_id, task_id) {
            tracing::debug!(node_id = %node_id, error = %e, "release skipped");
        }
        state
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Stale sessions, task timeouts, deadline expiry and retirement.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now(), now_ms())
    }

    pub fn sweep_at(&self, now: Instant, wall_ms: u64) -> SweepReport {
        let _pairing = self.pair();
        let mut report = SweepReport::default();

        for (node_id, task) in self.registry.expire_stale_at(self.settings.stale_after, now) {
            if let Some(task_id) = task {
                let state = self.abandon_held(&node_id, &task_id, wall_ms);
                report.record_abandon(task_id, state);
            }
            report.expired_sessions.push(node_id);
        }

        for (task_id, node_id) in self.queue.timed_out_at(self.settings.task_timeout, now) {
            tracing::warn!(node_id = %node_id, task_id = task_id.short(), "task timed out");
            report.timed_out.push(task_id.clone());
            let state = self.abandon_held(&node_id, &task_id, wall_ms);
            report.record_abandon(task_id, state);
        }

        report.expired_tasks = self.queue.expire_overdue_at(wall_ms);

        if let Some(grace) = self.settings.retire_after {
            report.retired = self.registry.retire_expired_at(grace, now);
        }

        if !report.requeued.is_empty() || !report.timed_out.is_empty() {
            self.notify();
        }
        report
    }

    /// Match until shutdown: every `interval`, and whenever notified.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(self.settings.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.wakeup.notified() => {}
                _ = shutdown.recv() => break,
            }
            let n = self.run_cycle();
            if n > 0 {
                tracing::debug!(assigned = n, "dispatch cycle");
            }
        }
        tracing::debug!("dispatcher stopped");
    }
}

impl SweepReport {
    fn record_abandon(&mut self, task_id: TaskId, state: Option<TaskState>) {
        match state {
            Some(TaskState::Pending) => self.requeued.push(task_id),
            Some(_) => self.finished.push(task_id),
            None => {}
        }
    }
}

fn failure_reason(payload: &serde_json::Value) -> String {
    match payload.get("error").and_then(|e| e.as_str()) {
        Some(msg) => msg.to_string(),
        None if payload.is_null() => "node reported failure".to_string(),
        None => payload.to_string(),
    }
}
