//! Node listing command.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct NodesResponse {
    nodes: Vec<NodeInfo>,
}

#[derive(Deserialize)]
struct NodeInfo {
    node_id: String,
    state: String,
    capability: Capability,
    remote: Option<String>,
    last_heartbeat_secs: u64,
    current_task_id: Option<String>,
    reconnects: u32,
    tasks_completed: u64,
    registration: Option<Registration>,
}

#[derive(Deserialize)]
struct Capability {
    arch: String,
    cores: u32,
    memory_mb: u64,
    device_class: String,
}

#[derive(Deserialize)]
struct Registration {
    container_orchestrator_registered: bool,
    batch_scheduler_registered: bool,
    health: String,
}

pub async fn cmd_nodes(port: u16) -> Result<()> {
    let resp: NodesResponse = get_json(&format!("{}/nodes", base_url(port))).await?;

    if resp.nodes.is_empty() {
        println!("No nodes have connected yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Nodes ({})", resp.nodes.len());
    println!("═══════════════════════════════════════");

    for n in &resp.nodes {
        let c = &n.capability;
        println!("  ┌─ {} [{}]", n.node_id, n.state);
        println!(
            "  │  device    : {} {} / {} cores / {} MiB",
            c.device_class, c.arch, c.cores, c.memory_mb
        );
        if let Some(addr) = &n.remote {
            println!("  │  remote    : {}", addr);
        }
        if let Some(task) = &n.current_task_id {
            println!("  │  task      : {}", &task[..12.min(task.len())]);
        }
        if let Some(r) = &n.registration {
            println!(
                "  │  clusters  : kubernetes={} slurm={} ({})",
                yes_no(r.container_orchestrator_registered),
                yes_no(r.batch_scheduler_registered),
                r.health
            );
        }
        println!(
            "  └─ heartbeat : {}s ago, {} reconnects, {} tasks done",
            n.last_heartbeat_secs, n.reconnects, n.tasks_completed
        );
    }

    Ok(())
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}
