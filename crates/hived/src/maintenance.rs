//! Periodic sweep: stale sessions, task timeouts, deadline expiry and
//! retirement. Retired nodes are deregistered from every backend.

use std::time::Duration;

use tokio::sync::broadcast;

use hive_services::{ClusterRegistrar, Dispatcher, SweepReport};

pub async fn maintenance_loop(
    dispatcher: Dispatcher,
    registrar: ClusterRegistrar,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let report = dispatcher.sweep();
                log_report(&report);
                for node_id in report.retired {
                    let registrar = registrar.clone();
                    tokio::spawn(async move {
                        registrar.deregister_node(&node_id).await;
                    });
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("maintenance loop shutting down");
                break;
            }
        }
    }
}

fn log_report(report: &SweepReport) {
    if report.is_empty() {
        return;
    }
    tracing::info!(
        stale = report.expired_sessions.len(),
        timed_out = report.timed_out.len(),
        requeued = report.requeued.len(),
        finished = report.finished.len(),
        expired = report.expired_tasks.len(),
        retired = report.retired.len(),
        "maintenance sweep"
    );
}
