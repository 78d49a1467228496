use std::sync::Arc;
use std::time::Duration;

use prechat_agent::AssistantRuntime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::outbox::Outbox;

/// Releases coalescing groups whose sender went quiet and answers them.
pub fn spawn_flush_loop(
    runtime: Arc<AssistantRuntime>,
    outbox: Arc<Outbox>,
    interval_secs: u64,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_every(interval_secs, shutdown, "flush", move || {
        let runtime = Arc::clone(&runtime);
        let outbox = Arc::clone(&outbox);
        async move {
            let released = flush_once(&runtime, &outbox).await;
            if released > 0 {
                let undelivered = outbox.len().await;
                debug!(
                    event_name = "server.worker.flush",
                    released,
                    undelivered,
                    "coalesced batches answered"
                );
            }
        }
    }))
}

pub fn spawn_maintenance_loop(
    runtime: Arc<AssistantRuntime>,
    interval_secs: u64,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_every(interval_secs, shutdown, "maintenance", move || {
        let runtime = Arc::clone(&runtime);
        async move {
            let report = runtime.coordinator().run_maintenance().await;
            info!(
                event_name = "server.worker.maintenance",
                cache_purged = report.cache_purged,
                stale_groups = report.stale_groups,
                senders_removed = report.sweep.removed,
                blocks_expired = report.sweep.expired_blocks,
                "maintenance sweep finished"
            );
        }
    }))
}

/// Answers every due batch and parks the replies for their senders. Returns how many ran.
pub async fn flush_once(runtime: &AssistantRuntime, outbox: &Outbox) -> usize {
    let batches = runtime.coordinator().drain_due().await;
    let released = batches.len();
    for batch in batches {
        let reply = runtime.handle_flushed(batch).await;
        outbox.push(reply).await;
    }
    released
}

async fn run_every<F, Fut>(
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
    name: &'static str,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(event_name = "server.worker.stopped", worker = name, "background worker stopped");
                    return;
                }
            }
        }
    }
}
