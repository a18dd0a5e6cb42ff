//! Task commands: list, inspect, submit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::http::{base_url, get_json, post_json_body};

#[derive(Deserialize)]
struct TasksResponse {
    tasks: Vec<TaskJson>,
}

#[derive(Deserialize)]
struct TaskJson {
    task_id: String,
    task_type: String,
    state: String,
    priority: i32,
    attempt_count: u32,
    max_attempts: u32,
    assigned_node_id: Option<String>,
    result: Option<serde_json::Value>,
    last_error: Option<String>,
}

#[derive(Serialize)]
struct SubmitRequest {
    task_type: String,
    payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deadline_secs: Option<u64>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    task_id: String,
    status: String,
}

/// Options accepted by `submit`.
#[derive(Default)]
pub struct SubmitOptions {
    pub priority: Option<i32>,
    pub max_attempts: Option<u32>,
    pub deadline_secs: Option<u64>,
}

impl SubmitOptions {
    /// Parse `--priority N`, `--attempts N`, `--deadline SECS`.
    pub fn parse(args: &[&str]) -> Result<Self> {
        let mut opts = Self::default();
        let mut i = 0;
        while i < args.len() {
            let value = args.get(i + 1).copied();
            match args[i] {
                "--priority" => {
                    opts.priority = Some(
                        value
                            .context("--priority requires a value")?
                            .parse()
                            .context("--priority must be an integer")?,
                    )
                }
                "--attempts" => {
                    opts.max_attempts = Some(
                        value
                            .context("--attempts requires a value")?
                            .parse()
                            .context("--attempts must be a positive integer")?,
                    )
                }
                "--deadline" => {
                    opts.deadline_secs = Some(
                        value
                            .context("--deadline requires a value")?
                            .parse()
                            .context("--deadline must be a number of seconds")?,
                    )
                }
                other => anyhow::bail!("unknown submit option: {}", other),
            }
            i += 2;
        }
        Ok(opts)
    }
}

pub async fn cmd_tasks(port: u16) -> Result<()> {
    let resp: TasksResponse = get_json(&format!("{}/tasks", base_url(port))).await?;

    if resp.tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Tasks ({})", resp.tasks.len());
    println!("═══════════════════════════════════════");

    for t in &resp.tasks {
        print_task(t);
    }

    Ok(())
}

pub async fn cmd_task(port: u16, task_id: &str) -> Result<()> {
    let task: TaskJson = get_json(&format!("{}/task/{}", base_url(port), task_id)).await?;
    print_task(&task);
    Ok(())
}

pub async fn cmd_submit(port: u16, task_type: &str, payload: &str, opts: SubmitOptions) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("payload must be valid JSON")?;

    let req = SubmitRequest {
        task_type: task_type.to_string(),
        payload,
        priority: opts.priority,
        max_attempts: opts.max_attempts,
        deadline_secs: opts.deadline_secs,
    };

    let resp: SubmitResponse =
        post_json_body(&format!("{}/submit_task", base_url(port)), &req).await?;

    println!("Task submitted.");
    println!("  task_id : {}", resp.task_id);
    println!("  status  : {}", resp.status);

    Ok(())
}

fn print_task(t: &TaskJson) {
    println!("  ┌─ {} [{}]", &t.task_id[..12.min(t.task_id.len())], t.state);
    println!("  │  type     : {} (priority {})", t.task_type, t.priority);
    println!("  │  attempts : {}/{}", t.attempt_count, t.max_attempts);
    if let Some(node) = &t.assigned_node_id {
        println!("  │  node     : {}", node);
    }
    if let Some(err) = &t.last_error {
        println!("  │  error    : {}", err);
    }
    match &t.result {
        Some(r) => println!("  └─ result   : {}", r),
        None => println!("  └─"),
    }
}
