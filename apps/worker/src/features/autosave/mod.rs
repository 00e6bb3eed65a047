//! Workspace Auto-Saver (spec §4.10): periodically flushes the guest
//! filesystem of every Running sandbox so a host crash loses at most one
//! interval's writes. Bounded concurrency and per-call deadline follow the
//! teacher's worker-pool pattern in `features/inventory/mod.rs`.

use std::sync::Arc;
use std::time::Duration;

use sandbox_types::SandboxStatus;
use tokio::sync::Semaphore;

use crate::features::vms::manager::VmManager;

const SYNC_DEADLINE: Duration = Duration::from_secs(10);

pub async fn run(manager: Arc<VmManager>, interval: Duration, concurrency: usize) {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let running: Vec<String> = manager
            .list()
            .await
            .into_iter()
            .filter(|s| s.status == SandboxStatus::Running)
            .map(|s| s.id)
            .collect();

        if running.is_empty() {
            continue;
        }

        let mut joins = Vec::with_capacity(running.len());
        for id in running {
            let manager = manager.clone();
            let semaphore = semaphore.clone();
            joins.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                match manager.sync_fs(&id, SYNC_DEADLINE).await {
                    Ok(()) => {
                        metrics::counter!("worker_autosave_success_total", 1);
                    }
                    Err(e) => {
                        metrics::counter!("worker_autosave_failure_total", 1);
                        tracing::warn!(sandbox_id = %id, error = %e, "autosave sync_fs failed");
                    }
                }
            }));
        }
        for join in joins {
            let _ = join.await;
        }
    }
}
