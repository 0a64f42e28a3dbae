//! The background reaper: drains completed-task outcomes and prunes
//! terminal task records from the queue, once per `UPDATE_TIMEOUT`.
//!
//! Grounded in `at-daemon::daemon::Daemon::run_loops`'s `tokio::select!`
//! over `tokio::time::interval` ticks, generalized from three patrol/
//! heartbeat/kpi loops down to the one tick ActiveTigger's queue needs.

use std::sync::Arc;
use std::time::Duration;

use tigger_queue::Queue;
use tokio::sync::watch;
use tracing::{info, warn};

/// Runs until `shutdown` is set to `true`. Each tick drains every pending
/// `TaskOutcome` (logging failures) and then removes terminal task records
/// via `Queue::drain_terminal`, so the in-flight task table doesn't grow
/// without bound across a long-running process.
pub async fn run(queue: Arc<Queue>, update_timeout_secs: u64, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(update_timeout_secs.max(1)));
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let outcomes = queue.outcomes();
                while let Ok(outcome) = outcomes.try_recv() {
                    match &outcome.result {
                        Ok(_) => info!(
                            task_id = %outcome.unique_id,
                            kind = ?outcome.kind,
                            project = %outcome.project_slug,
                            "task completed"
                        ),
                        Err(e) => warn!(
                            task_id = %outcome.unique_id,
                            kind = ?outcome.kind,
                            project = %outcome.project_slug,
                            error = %e,
                            "task failed"
                        ),
                    }
                }
                let reaped = queue.drain_terminal().await;
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "reaped terminal task records");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("reaper stopping");
                    break;
                }
            }
        }
    }
}
