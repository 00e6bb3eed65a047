//! Sandbox Router (spec §4.9): per-sandbox state machine, rolling idle
//! timeout, and single-flight wake. Sits in front of every externally
//! triggered operation and guarantees a sandbox is Running before the VM
//! Manager is invoked.
//!
//! There is no session-store collaborator in this worker (spec §1 keeps
//! that external); `EnsureRunning` on an untracked id is therefore a
//! `not-found`, not a discovery lookup — see DESIGN.md.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sandbox_types::{SandboxError, SandboxResult, WakeReq};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::time::Instant;

use crate::features::vms::manager::VmManager;

const WAKE_TOTAL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Running,
    Hibernated,
    Waking,
}

type WakeResult = Result<(), String>;

struct Entry {
    state: Mutex<RouteState>,
    timeout: Mutex<Duration>,
    deadline: Mutex<Instant>,
    notify: Notify,
    wake_slot: Mutex<Option<watch::Receiver<Option<WakeResult>>>>,
}

impl Entry {
    fn new(state: RouteState, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            timeout: Mutex::new(timeout),
            deadline: Mutex::new(Instant::now() + timeout),
            notify: Notify::new(),
            wake_slot: Mutex::new(None),
        })
    }
}

/// Observes every routed operation; returning `Err` short-circuits before
/// `EnsureRunning` or the wrapped call run. Registered middlewares run in
/// registration order (spec §4.9: "outermost registered first").
pub type Middleware = Arc<dyn Fn(&str, &str) -> SandboxResult<()> + Send + Sync>;

pub struct SandboxRouter {
    entries: Arc<RwLock<HashMap<String, Arc<Entry>>>>,
    manager: Arc<VmManager>,
    middlewares: RwLock<Vec<Middleware>>,
}

impl SandboxRouter {
    pub fn new(manager: Arc<VmManager>) -> Self {
        Self { entries: Arc::new(RwLock::new(HashMap::new())), manager, middlewares: RwLock::new(Vec::new()) }
    }

    pub async fn add_middleware(&self, mw: Middleware) {
        self.middlewares.write().await.push(mw);
    }

    pub async fn register(&self, id: &str, timeout: Duration) {
        let entry = Entry::new(RouteState::Running, timeout);
        self.entries.write().await.insert(id.to_string(), entry.clone());
        self.spawn_timer(id.to_string(), entry);
    }

    pub async fn unregister(&self, id: &str) {
        if let Some(entry) = self.entries.write().await.remove(id) {
            entry.notify.notify_waiters();
        }
    }

    pub async fn mark_hibernated(&self, id: &str, timeout: Duration) {
        let mut entries = self.entries.write().await;
        match entries.get(id).cloned() {
            Some(entry) => {
                *entry.state.lock().await = RouteState::Hibernated;
                entry.notify.notify_waiters();
            }
            None => {
                let entry = Entry::new(RouteState::Hibernated, timeout);
                entries.insert(id.to_string(), entry);
            }
        }
    }

    pub async fn touch(&self, id: &str) {
        let entry = self.entries.read().await.get(id).cloned();
        if let Some(entry) = entry {
            if *entry.state.lock().await == RouteState::Running {
                reset_deadline(&entry).await;
            }
        }
    }

    pub async fn set_timeout(&self, id: &str, d: Duration) {
        let entry = self.entries.read().await.get(id).cloned();
        if let Some(entry) = entry {
            *entry.timeout.lock().await = d;
            if *entry.state.lock().await == RouteState::Running {
                reset_deadline(&entry).await;
            }
        }
    }

    pub async fn state_of(&self, id: &str) -> Option<RouteState> {
        let entry = self.entries.read().await.get(id).cloned()?;
        Some(*entry.state.lock().await)
    }

    /// Spec §4.9 `Route`: middleware chain, ensure-running, invoke, always
    /// reset the timer afterward regardless of outcome.
    pub async fn route<F, Fut, T>(&self, id: &str, op: &str, f: F) -> SandboxResult<T>
    where
        F: FnOnce(Arc<VmManager>) -> Fut,
        Fut: Future<Output = SandboxResult<T>>,
    {
        for mw in self.middlewares.read().await.iter() {
            mw(id, op)?;
        }
        self.ensure_running(id).await?;
        let result = f(self.manager.clone()).await;
        self.touch(id).await;
        result
    }

    /// Spec §4.9 `EnsureRunning`.
    pub async fn ensure_running(&self, id: &str) -> SandboxResult<()> {
        loop {
            let entry = self
                .entries
                .read()
                .await
                .get(id)
                .cloned()
                .ok_or_else(|| SandboxError::NotFound(format!("sandbox not tracked by router: {id}")))?;

            let state = *entry.state.lock().await;
            match state {
                RouteState::Running => return Ok(()),
                RouteState::Waking => {
                    let mut rx = entry
                        .wake_slot
                        .lock()
                        .await
                        .clone()
                        .ok_or_else(|| SandboxError::DeadlineExceeded)?;
                    drop(entry);
                    wait_wake_slot(&mut rx).await?;
                    return Ok(());
                }
                RouteState::Hibernated => {
                    let (tx, rx) = watch::channel(None);
                    *entry.state.lock().await = RouteState::Waking;
                    *entry.wake_slot.lock().await = Some(rx.clone());
                    self.spawn_wake(id.to_string(), entry.clone(), tx);
                    let mut rx = rx;
                    wait_wake_slot(&mut rx).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Spec §4.9 `DoWake`: a fresh background-rooted context, 60s cap.
    /// Single-flight by construction — only the caller that observed
    /// `Hibernated` (and transitioned it to `Waking`) spawns this; every
    /// other concurrent caller observes `Waking` and waits on the slot.
    fn spawn_wake(&self, id: String, entry: Arc<Entry>, tx: watch::Sender<Option<WakeResult>>) {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(
                WAKE_TOTAL_TIMEOUT,
                manager.wake(&id, WakeReq { checkpoint_key: None, timeout_seconds: WAKE_TOTAL_TIMEOUT.as_secs() }),
            )
            .await;

            let result = match outcome {
                Ok(Ok(_handle)) => {
                    *entry.state.lock().await = RouteState::Running;
                    reset_deadline(&entry).await;
                    Ok(())
                }
                Ok(Err(e)) => {
                    *entry.state.lock().await = RouteState::Hibernated;
                    Err(e.to_string())
                }
                Err(_) => {
                    *entry.state.lock().await = RouteState::Hibernated;
                    Err("wake timed out after 60s".to_string())
                }
            };
            let _ = tx.send(Some(result));
        });
    }

    fn spawn_timer(&self, id: String, entry: Arc<Entry>) {
        let manager = self.manager.clone();
        let entries = self.entries.clone();
        tokio::spawn(async move {
            loop {
                let still_tracked = entries.read().await.get(&id).map(|e| Arc::ptr_eq(e, &entry)).unwrap_or(false);
                if !still_tracked {
                    return;
                }
                let deadline = *entry.deadline.lock().await;
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = entry.notify.notified() => { continue; }
                }
                let still_tracked = entries.read().await.get(&id).map(|e| Arc::ptr_eq(e, &entry)).unwrap_or(false);
                if !still_tracked {
                    return;
                }
                if tokio::time::Instant::now() < *entry.deadline.lock().await {
                    continue;
                }
                if *entry.state.lock().await != RouteState::Running {
                    continue;
                }
                on_timeout(&id, &entry, &manager, &entries).await;
            }
        });
    }
}

async fn reset_deadline(entry: &Entry) {
    let timeout = *entry.timeout.lock().await;
    *entry.deadline.lock().await = Instant::now() + timeout;
    entry.notify.notify_waiters();
}

async fn wait_wake_slot(rx: &mut watch::Receiver<Option<WakeResult>>) -> SandboxResult<()> {
    loop {
        if let Some(result) = rx.borrow().clone() {
            return result.map_err(SandboxError::AgentUnreachable);
        }
        if rx.changed().await.is_err() {
            return Err(SandboxError::Cancelled);
        }
    }
}

/// Spec §4.9 `onTimeout`: idle expiry of a Running sandbox.
async fn on_timeout(id: &str, entry: &Entry, manager: &Arc<VmManager>, entries: &Arc<RwLock<HashMap<String, Arc<Entry>>>>) {
    match manager.hibernate(id).await {
        Ok(resp) => {
            *entry.state.lock().await = RouteState::Hibernated;
            tracing::info!(sandbox_id = %id, checkpoint_key = %resp.checkpoint_key, "idle timeout hibernated sandbox");
        }
        Err(e) => {
            tracing::warn!(sandbox_id = %id, error = %e, "idle-timeout hibernate failed, killing sandbox instead");
            if let Err(e) = manager.kill(id).await {
                tracing::error!(sandbox_id = %id, error = %e, "idle-timeout kill also failed");
            }
            // Sandbox is gone either way; drop the router's own tracking so
            // spawn_timer's loop doesn't keep re-triggering onTimeout on a
            // dead id with a deadline that's already in the past.
            if let Some(dead) = entries.write().await.remove(id) {
                dead.notify.notify_waiters();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::core::hostnet::HostNetProgrammer;
    use crate::core::objectstore::ObjectStoreClient;
    use crate::core::subnet::SubnetAllocator;

    fn test_manager() -> Arc<VmManager> {
        let config = Arc::new(WorkerConfig {
            bind: "127.0.0.1:0".into(),
            data_dir: std::path::PathBuf::from("/tmp/router-tests"),
            kernel_path: std::path::PathBuf::from("/dev/null"),
            images_dir: std::path::PathBuf::from("/tmp/router-tests/images"),
            hypervisor_bin: "true".into(),
            default_memory_mib: 128,
            default_cpu_count: 1,
            default_disk_mib: 64,
            default_guest_port: 80,
            subnet_prefix_octet: 10,
            subnet_pool_size: 1 << 10,
            tap_prefix: "wk".into(),
            egress_iface: None,
            object_store_url: "http://127.0.0.1:0".into(),
            cache_dir: None,
            default_idle_timeout_secs: 600,
            autosave_interval_secs: 30,
            autosave_concurrency: 4,
        });
        let subnet = Arc::new(SubnetAllocator::new(config.subnet_prefix_octet, config.subnet_pool_size, config.tap_prefix.clone()));
        let hostnet = Arc::new(HostNetProgrammer::new(None));
        let object_store = Arc::new(ObjectStoreClient::new(config.object_store_url.clone(), None));
        Arc::new(VmManager::new(config, subnet, hostnet, object_store))
    }

    #[tokio::test]
    async fn register_then_unregister_clears_tracking() {
        let router = SandboxRouter::new(test_manager());
        router.register("sbx-1", Duration::from_secs(60)).await;
        assert_eq!(router.state_of("sbx-1").await, Some(RouteState::Running));

        router.unregister("sbx-1").await;
        assert_eq!(router.state_of("sbx-1").await, None);
    }

    #[tokio::test]
    async fn mark_hibernated_on_untracked_id_creates_hibernated_entry() {
        let router = SandboxRouter::new(test_manager());
        router.mark_hibernated("sbx-2", Duration::from_secs(300)).await;
        assert_eq!(router.state_of("sbx-2").await, Some(RouteState::Hibernated));
    }

    #[tokio::test]
    async fn ensure_running_on_untracked_id_is_not_found() {
        let router = SandboxRouter::new(test_manager());
        let err = router.ensure_running("ghost").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    #[tokio::test]
    async fn route_short_circuits_when_a_middleware_rejects() {
        let router = SandboxRouter::new(test_manager());
        router.register("sbx-3", Duration::from_secs(60)).await;
        router
            .add_middleware(Arc::new(|_id, _op| Err(SandboxError::InvalidArgument("blocked by policy".into()))))
            .await;

        let result = router.route("sbx-3", "exec", |_m| async { Ok::<_, SandboxError>(()) }).await;
        assert!(matches!(result, Err(SandboxError::InvalidArgument(_))));
    }
}
