//! hive-ctl — command-line interface for the Hive coordinator.

mod cmd;

use anyhow::{Context, Result};

use cmd::nodes::cmd_nodes;
use cmd::status::cmd_status;
use cmd::tasks::{cmd_submit, cmd_task, cmd_tasks, SubmitOptions};

const DEFAULT_PORT: u16 = 8766;

fn print_usage() {
    println!("Usage: hive-ctl [--port N] <command>");
    println!();
    println!("Commands:");
    println!("  status                         Node and task counts, registration health");
    println!("  nodes                          Connected and known nodes");
    println!("  tasks                          All retained tasks");
    println!("  task <task_id>                 One task in detail");
    println!("  submit <type> <json-payload>   Queue a task");
    println!("      [--priority N] [--attempts N] [--deadline SECS]");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port option
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd_status(port).await,
        ["nodes"] => cmd_nodes(port).await,
        ["tasks"] => cmd_tasks(port).await,
        ["task", id] => cmd_task(port, id).await,
        ["submit", task_type, payload, rest @ ..] => {
            let opts = SubmitOptions::parse(rest)?;
            cmd_submit(port, task_type, payload, opts).await
        }
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
