//! Task queue — every task the coordinator has accepted, with a priority
//! index over the PENDING ones.
//!
//! All state sits behind one mutex. Operations are short and never await,
//! so the lock is a plain `std::sync::Mutex`.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use hive_core::config::QueueConfig;
use hive_core::types::now_ms;
use hive_core::{CoordError, NodeId, TaskId, TaskState};

/// A submission, before it has an id.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: u32,
    /// Unix ms after which the task is no longer worth running.
    pub deadline: Option<u64>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: 0,
            max_attempts: 1,
            deadline: None,
        }
    }
}

#[derive(Debug)]
struct Task {
    task_id: TaskId,
    task_type: String,
    payload: serde_json::Value,
    priority: i32,
    state: TaskState,
    assigned_node_id: Option<NodeId>,
    attempt_count: u32,
    max_attempts: u32,
    /// Submission order. A requeued task keeps it.
    seq: u64,
    submitted_at: u64,
    updated_at: u64,
    deadline: Option<u64>,
    result: Option<serde_json::Value>,
    last_error: Option<String>,
    /// Last node-originated event (assign, ack) for the outstanding attempt.
    last_activity: Option<Instant>,
}

impl Task {
    fn pending_key(&self) -> PendingKey {
        (Reverse(self.priority), self.seq, self.task_id.clone())
    }

    fn deadline_passed(&self, now: u64) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            task_type: self.task_type.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
            state: self.state,
            assigned_node_id: self.assigned_node_id.clone(),
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            submitted_at: self.submitted_at,
            updated_at: self.updated_at,
            deadline: self.deadline,
            result: self.result.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Highest priority first, then oldest submission.
type PendingKey = (Reverse<i32>, u64, TaskId);

#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_node_id: Option<NodeId>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub submitted_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub expired: usize,
}

#[derive(Default)]
struct QueueInner {
    tasks: HashMap<TaskId, Task>,
    pending: BTreeSet<PendingKey>,
    inflight_by_node: HashMap<NodeId, TaskId>,
    /// Terminal tasks in the order they finished, for pruning.
    terminal: VecDeque<TaskId>,
    next_seq: u64,
}

impl QueueInner {
    fn live(&self) -> usize {
        self.tasks.len() - self.terminal.len()
    }

    fn get_mut(&mut self, task_id: &TaskId) -> Result<&mut Task, CoordError> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| CoordError::UnknownTask(task_id.clone()))
    }

    /// Take an outstanding task off its node, then either requeue it or
    /// move it to `terminal_state`.
    fn retry_or_finish(
        &mut self,
        task_id: &TaskId,
        error: String,
        terminal_state: TaskState,
        retained: usize,
    ) -> Result<TaskState, CoordError> {
        let task = self.get_mut(task_id)?;
        let node = task.assigned_node_id.take();
        task.last_error = Some(error);
        task.last_activity = None;
        task.updated_at = now_ms();
        let requeue = terminal_state == TaskState::Failed && task.attempt_count < task.max_attempts;
        let next = if requeue { TaskState::Pending } else { terminal_state };
        task.state = next;
        let key = task.pending_key();

        if let Some(node) = node {
            self.inflight_by_node.remove(&node);
        }
        if requeue {
            self.pending.insert(key);
        } else {
            self.finish(task_id.clone(), retained);
        }
        Ok(next)
    }

    fn finish(&mut self, task_id: TaskId, retained: usize) {
        debug_assert!(self.tasks.get(&task_id).is_some_and(|t| t.state.is_terminal()));
        self.terminal.push_back(task_id);
        while self.terminal.len() > retained {
            if let Some(old) = self.terminal.pop_front() {
                self.tasks.remove(&old);
            }
        }
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Mutex<QueueInner>>,
    capacity: usize,
    retained_terminal: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize, retained_terminal: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner::default())),
            capacity,
            retained_terminal,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.capacity, config.retained_terminal)
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn submit(&self, new: NewTask) -> Result<TaskId, CoordError> {
        if new.task_type.trim().is_empty() {
            return Err(CoordError::InvalidRequest("task_type must not be empty".into()));
        }
        let now = now_ms();
        if new.deadline.is_some_and(|d| d <= now) {
            return Err(CoordError::InvalidRequest("deadline is already in the past".into()));
        }

        let mut inner = self.lock();
        if inner.live() >= self.capacity {
            return Err(CoordError::QueueFull {
                capacity: self.capacity,
            });
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let payload_bytes = serde_json::to_vec(&new.payload).unwrap_or_default();
        let task_id = TaskId::derive(seq, now, &payload_bytes);

        let task = Task {
            task_id: task_id.clone(),
            task_type: new.task_type,
            payload: new.payload,
            priority: new.priority,
            state: TaskState::Pending,
            assigned_node_id: None,
            attempt_count: 0,
            max_attempts: new.max_attempts.max(1),
            seq,
            submitted_at: now,
            updated_at: now,
            deadline: new.deadline,
            result: None,
            last_error: None,
            last_activity: None,
        };
        inner.pending.insert(task.pending_key());
        inner.tasks.insert(task_id.clone(), task);
        Ok(task_id)
    }

    /// Highest-priority, oldest PENDING task, without claiming it.
    pub fn next_pending(&self) -> Option<TaskSnapshot> {
        let inner = self.lock();
        let (_, _, id) = inner.pending.first()?;
        inner.tasks.get(id).map(Task::snapshot)
    }

    /// PENDING → ASSIGNED to `node_id`. Returns the task as assigned, with
    /// the new attempt number.
    pub fn mark_assigned(&self, task_id: &TaskId, node_id: &NodeId) -> Result<TaskSnapshot, CoordError> {
        let mut inner = self.lock();
        if let Some(held) = inner.inflight_by_node.get(node_id) {
            if held != task_id {
                return Err(CoordError::invalid_node(node_id, "holding another task", "assign"));
            }
        }
        let task = inner.get_mut(task_id)?;
        if task.state != TaskState::Pending {
            return Err(CoordError::invalid_task(task_id, task.state, "assign"));
        }
        task.state = TaskState::Assigned;
        task.assigned_node_id = Some(node_id.clone());
        task.attempt_count += 1;
        task.last_activity = Some(Instant::now());
        task.updated_at = now_ms();
        let key = task.pending_key();
        let snap = task.snapshot();

        inner.pending.remove(&key);
        inner.inflight_by_node.insert(node_id.clone(), task_id.clone());
        Ok(snap)
    }

    /// Delivery rollback: ASSIGNED → PENDING as though the assignment never
    /// happened.
    pub fn unassign(&self, task_id: &TaskId, node_id: &NodeId) -> Result<(), CoordError> {
        let mut inner = self.lock();
        let task = inner.get_mut(task_id)?;
        if task.state != TaskState::Assigned || task.assigned_node_id.as_ref() != Some(node_id) {
            return Err(CoordError::invalid_task(task_id, task.state, "unassign"));
        }
        task.state = TaskState::Pending;
        task.assigned_node_id = None;
        task.attempt_count = task.attempt_count.saturating_sub(1);
        task.last_activity = None;
        task.updated_at = now_ms();
        let key = task.pending_key();

        inner.inflight_by_node.remove(node_id);
        inner.pending.insert(key);
        Ok(())
    }

    /// ASSIGNED → RUNNING on the node's acknowledgement.
    pub fn mark_running(&self, task_id: &TaskId) -> Result<(), CoordError> {
        let mut inner = self.lock();
        let task = inner.get_mut(task_id)?;
        if task.state != TaskState::Assigned {
            return Err(CoordError::invalid_task(task_id, task.state, "start"));
        }
        task.state = TaskState::Running;
        task.last_activity = Some(Instant::now());
        task.updated_at = now_ms();
        Ok(())
    }

    /// RUNNING → SUCCEEDED.
    pub fn complete(&self, task_id: &TaskId, result: serde_json::Value) -> Result<(), CoordError> {
        let mut inner = self.lock();
        let task = inner.get_mut(task_id)?;
        if task.state != TaskState::Running {
            return Err(CoordError::invalid_task(task_id, task.state, "complete"));
        }
        task.state = TaskState::Succeeded;
        task.result = Some(result);
        task.last_activity = None;
        task.updated_at = now_ms();
        let node = task.assigned_node_id.take();

        if let Some(node) = node {
            inner.inflight_by_node.remove(&node);
        }
        inner.finish(task_id.clone(), self.retained_terminal);
        Ok(())
    }

    /// Outstanding → PENDING while attempts remain, else FAILED. Returns the
    /// new state.
    pub fn fail(&self, task_id: &TaskId, error: impl Into<String>) -> Result<TaskState, CoordError> {
        let mut inner = self.lock();
        let task = inner.get_mut(task_id)?;
        if !task.state.is_outstanding() {
            return Err(CoordError::invalid_task(task_id, task.state, "fail"));
        }
        inner.retry_or_finish(task_id, error.into(), TaskState::Failed, self.retained_terminal)
    }

    /// The node holding the task went away or stopped making progress.
    /// Retries like `fail`, unless the deadline has passed → EXPIRED.
    pub fn abandon(&self, task_id: &TaskId) -> Result<TaskState, CoordError> {
        self.abandon_at(task_id, now_ms())
    }

    pub fn abandon_at(&self, task_id: &TaskId, now: u64) -> Result<TaskState, CoordError> {
        let mut inner = self.lock();
        let task = inner.get_mut(task_id)?;
        if !task.state.is_outstanding() {
            return Err(CoordError::invalid_task(task_id, task.state, "abandon"));
        }
        let (reason, state) = if task.deadline_passed(now) {
            ("deadline passed while abandoned".to_string(), TaskState::Expired)
        } else {
            ("abandoned by node".to_string(), TaskState::Failed)
        };
        inner.retry_or_finish(task_id, reason, state, self.retained_terminal)
    }

    /// Outstanding tasks with no node activity for `timeout`, with the node
    /// holding each.
    pub fn timed_out(&self, timeout: Duration) -> Vec<(TaskId, NodeId)> {
        self.timed_out_at(timeout, Instant::now())
    }

    pub fn timed_out_at(&self, timeout: Duration, now: Instant) -> Vec<(TaskId, NodeId)> {
        let inner = self.lock();
        let mut out: Vec<(u64, TaskId, NodeId)> = inner
            .tasks
            .values()
            .filter(|t| t.state.is_outstanding())
            .filter(|t| {
                t.last_activity
                    .is_some_and(|at| now.saturating_duration_since(at) > timeout)
            })
            .filter_map(|t| {
                t.assigned_node_id
                    .clone()
                    .map(|n| (t.seq, t.task_id.clone(), n))
            })
            .collect();
        out.sort();
        out.into_iter().map(|(_, t, n)| (t, n)).collect()
    }

    /// PENDING tasks past their deadline → EXPIRED.
    pub fn expire_overdue(&self) -> Vec<TaskId> {
        self.expire_overdue_at(now_ms())
    }

    pub fn expire_overdue_at(&self, now: u64) -> Vec<TaskId> {
        let mut inner = self.lock();
        let overdue: Vec<PendingKey> = inner
            .pending
            .iter()
            .filter(|(_, _, id)| inner.tasks.get(id).is_some_and(|t| t.deadline_passed(now)))
            .cloned()
            .collect();

        let mut expired = Vec::with_capacity(overdue.len());
        for key in overdue {
            inner.pending.remove(&key);
            let id = key.2;
            if let Some(task) = inner.tasks.get_mut(&id) {
                task.state = TaskState::Expired;
                task.last_error = Some("deadline passed before assignment".into());
                task.updated_at = now_ms();
            }
            inner.finish(id.clone(), self.retained_terminal);
            expired.push(id);
        }
        expired
    }

    pub fn status(&self, task_id: &TaskId) -> Result<TaskSnapshot, CoordError> {
        self.lock()
            .tasks
            .get(task_id)
            .map(Task::snapshot)
            .ok_or_else(|| CoordError::UnknownTask(task_id.clone()))
    }

    /// The task `node_id` currently holds, if any.
    pub fn outstanding_for(&self, node_id: &NodeId) -> Option<TaskId> {
        self.lock().inflight_by_node.get(node_id).cloned()
    }

    /// All retained tasks in submission order.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let inner = self.lock();
        let mut tasks: Vec<&Task> = inner.tasks.values().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks.into_iter().map(Task::snapshot).collect()
    }

    pub fn counts(&self) -> TaskCounts {
        let inner = self.lock();
        let mut counts = TaskCounts {
            total: inner.tasks.len(),
            ..TaskCounts::default()
        };
        for task in inner.tasks.values() {
            match task.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Assigned => counts.assigned += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Succeeded => counts.succeeded += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Expired => counts.expired += 1,
            }
        }
        counts
    }
}
