//! Coordinator status command.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct StatusResponse {
    uptime_secs: u64,
    nodes: NodeCounts,
    registration: RegistrationInfo,
    tasks: TaskCounts,
    queue_capacity: usize,
}

#[derive(Deserialize)]
struct NodeCounts {
    total: usize,
    connecting: usize,
    registering: usize,
    idle: usize,
    busy: usize,
    disconnected: usize,
    retired: usize,
}

#[derive(Deserialize)]
struct RegistrationInfo {
    standalone: bool,
    backends: Vec<String>,
    health: HealthCounts,
    #[serde(default)]
    clusters: BTreeMap<String, ClusterInfo>,
}

#[derive(Deserialize)]
struct ClusterInfo {
    registered_nodes: usize,
}

#[derive(Deserialize)]
struct HealthCounts {
    healthy: usize,
    partial: usize,
    degraded: usize,
}

#[derive(Deserialize)]
struct TaskCounts {
    pending: usize,
    assigned: usize,
    running: usize,
    succeeded: usize,
    failed: usize,
    expired: usize,
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;
    let n = &resp.nodes;
    let t = &resp.tasks;

    println!("═══════════════════════════════════════");
    println!("  Hive Coordinator Status");
    println!("═══════════════════════════════════════");
    println!("  Uptime           : {}s", resp.uptime_secs);
    println!("  Nodes            : {} total", n.total);
    println!("  ┌─ connecting    : {}", n.connecting);
    println!("  │  registering   : {}", n.registering);
    println!("  │  idle          : {}", n.idle);
    println!("  │  busy          : {}", n.busy);
    println!("  │  disconnected  : {}", n.disconnected);
    println!("  └─ retired       : {}", n.retired);

    let r = &resp.registration;
    if r.standalone {
        println!("  Registration     : standalone (no backends)");
    } else {
        println!("  Registration     : {}", r.backends.join(", "));
        for (backend, info) in &r.clusters {
            println!("  │  {:<14}: {} registered", backend, info.registered_nodes);
        }
        println!(
            "  ┌─ healthy {}  partial {}  degraded {}",
            r.health.healthy, r.health.partial, r.health.degraded
        );
        if r.health.degraded > 0 {
            println!("  └─ warning: {} node(s) registered nowhere", r.health.degraded);
        }
    }

    println!("  Tasks            : capacity {}", resp.queue_capacity);
    println!("  ┌─ pending       : {}", t.pending);
    println!("  │  assigned      : {}", t.assigned);
    println!("  │  running       : {}", t.running);
    println!("  │  succeeded     : {}", t.succeeded);
    println!("  │  failed        : {}", t.failed);
    println!("  └─ expired       : {}", t.expired);

    Ok(())
}
