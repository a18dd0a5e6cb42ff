//! /submit_task, /tasks and /task/{task_id} handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use hive_core::types::now_ms;
use hive_core::{TaskId, TaskState};
use hive_services::{NewTask, TaskSnapshot};

use super::{error_response, ApiState};

// ── /submit_task (POST) ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SubmitTaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub priority: Option<i32>,
    pub max_attempts: Option<u32>,
    /// Seconds from now after which the task is no longer worth running.
    pub deadline_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
    pub status: TaskState,
}

pub async fn handle_submit_task(
    State(state): State<ApiState>,
    body: Result<Json<SubmitTaskRequest>, JsonRejection>,
) -> Result<Json<SubmitTaskResponse>, (StatusCode, String)> {
    let Json(req) = body.map_err(|e| (StatusCode::BAD_REQUEST, e.body_text()))?;

    let deadline = match req.deadline_secs {
        Some(0) => return Err((StatusCode::BAD_REQUEST, "deadline_secs must be positive".to_string())),
        Some(secs) => match secs.checked_mul(1000).and_then(|ms| now_ms().checked_add(ms)) {
            Some(at) => Some(at),
            None => return Err((StatusCode::BAD_REQUEST, "deadline_secs out of range".to_string())),
        },
        None => None,
    };

    let task = NewTask {
        task_type: req.task_type,
        payload: req.payload,
        priority: req.priority.unwrap_or(0),
        max_attempts: req.max_attempts.unwrap_or(state.default_max_attempts),
        deadline,
    };
    let task_type = task.task_type.clone();
    let task_id = state.queue.submit(task).map_err(|e| {
        tracing::warn!(error = %e, "task submission rejected");
        error_response(e)
    })?;

    tracing::info!(task_id = task_id.short(), task_type = %task_type, "task submitted");
    state.dispatcher.notify();

    Ok(Json(SubmitTaskResponse {
        task_id,
        status: TaskState::Pending,
    }))
}

// ── /tasks (GET) ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct TasksQuery {
    /// Only tasks in this state, e.g. `?state=PENDING`.
    pub state: Option<TaskState>,
}

#[derive(Serialize)]
pub struct TasksResponse {
    pub tasks: Vec<TaskSnapshot>,
}

pub async fn handle_tasks(
    State(state): State<ApiState>,
    Query(query): Query<TasksQuery>,
) -> Json<TasksResponse> {
    let tasks = state
        .queue
        .list()
        .into_iter()
        .filter(|t| query.state.map_or(true, |s| t.state == s))
        .collect();
    Json(TasksResponse { tasks })
}

// ── /task/{task_id} (GET) ─────────────────────────────────────────────────────

pub async fn handle_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskSnapshot>, (StatusCode, String)> {
    state
        .queue
        .status(&TaskId::new(task_id))
        .map(Json)
        .map_err(error_response)
}
