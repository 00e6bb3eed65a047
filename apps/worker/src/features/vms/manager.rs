//! VM Manager (spec §4.8): the central owner of live sandbox state. One
//! mutex guards the map; everything else lives inside the VM instance
//! record so the map lock is never held across suspending I/O, matching
//! the "no lock across await" rule spec §9 calls out and the teacher's own
//! habit of keeping shared maps behind a single `Mutex`/`RwLock`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sandbox_types::{
    CreateSandboxReq, HibernateResp, NetworkAllocation, SandboxError, SandboxHandle, SandboxId, SandboxMeta,
    SandboxResult, SandboxStatus, SandboxSummary, SaveAsTemplateReq, SnapshotMeta, WakeReq,
};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::WorkerConfig;
use crate::core::agent_client::AgentClient;
use crate::core::hostnet::HostNetProgrammer;
use crate::core::hypervisor::HypervisorClient;
use crate::core::objectstore::ObjectStoreClient;
use crate::core::subnet::SubnetAllocator;
use crate::core::{archiver, drives, ids};

const HYPERVISOR_SOCKET_TIMEOUT: Duration = Duration::from_secs(5);
const AGENT_READY_TIMEOUT: Duration = Duration::from_secs(30);
const SYNC_FS_TIMEOUT: Duration = Duration::from_secs(5);
const AGENT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_WAKE_TIMEOUT_SECS: u64 = 300;

/// Live sandbox state. Owned exclusively by the `VmManager` while present
/// in its map (spec §3 invariant: at most one instance per id).
pub struct VmInstance {
    pub id: SandboxId,
    pub template: String,
    pub status: AsyncMutex<SandboxStatus>,
    pub started_at: chrono::DateTime<Utc>,
    pub end_at: AsyncMutex<chrono::DateTime<Utc>>,
    pub cpu_count: u8,
    pub memory_mib: u32,
    pub guest_port: u16,
    pub host_port: AsyncMutex<u16>,
    pub network: AsyncMutex<NetworkAllocation>,
    pub guest_cid: AsyncMutex<u32>,
    pub guest_mac: String,
    pub sandbox_dir: PathBuf,
    pub vsock_sock: AsyncMutex<PathBuf>,
    hypervisor: AsyncMutex<Option<Child>>,
    agent: AsyncMutex<Option<Arc<AgentClient>>>,
    dnat_installed: AsyncMutex<bool>,
}

impl VmInstance {
    pub fn rootfs_path(&self) -> PathBuf {
        self.sandbox_dir.join("rootfs.ext4")
    }
    pub fn workspace_path(&self) -> PathBuf {
        self.sandbox_dir.join("workspace.ext4")
    }
    pub fn hypervisor_sock(&self) -> PathBuf {
        self.sandbox_dir.join("hypervisor.sock")
    }

    pub async fn summary(&self) -> SandboxSummary {
        SandboxSummary {
            id: self.id.clone(),
            template: self.template.clone(),
            status: *self.status.lock().await,
            started_at: self.started_at,
            end_at: *self.end_at.lock().await,
            cpu_count: self.cpu_count,
            memory_mib: self.memory_mib,
            host_port: *self.host_port.lock().await,
        }
    }

    pub async fn agent(&self) -> SandboxResult<Arc<AgentClient>> {
        self.agent
            .lock()
            .await
            .clone()
            .ok_or_else(|| SandboxError::PreconditionFailed(format!("sandbox {} has no live agent connection", self.id)))
    }
}

/// `vms`, the next-CID counter, and the in-flight async-upload counter are
/// the only shared state (spec §4.8).
pub struct VmManager {
    config: Arc<WorkerConfig>,
    subnet: Arc<SubnetAllocator>,
    hostnet: Arc<HostNetProgrammer>,
    object_store: Arc<ObjectStoreClient>,
    vms: AsyncMutex<HashMap<SandboxId, Arc<VmInstance>>>,
    next_cid: AtomicU32,
    inflight_uploads: Arc<AtomicUsize>,
    uploads_idle: Arc<tokio::sync::Notify>,
}

impl VmManager {
    pub fn new(
        config: Arc<WorkerConfig>,
        subnet: Arc<SubnetAllocator>,
        hostnet: Arc<HostNetProgrammer>,
        object_store: Arc<ObjectStoreClient>,
    ) -> Self {
        Self {
            config,
            subnet,
            hostnet,
            object_store,
            vms: AsyncMutex::new(HashMap::new()),
            next_cid: AtomicU32::new(3),
            inflight_uploads: Arc::new(AtomicUsize::new(0)),
            uploads_idle: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub async fn get(&self, id: &str) -> SandboxResult<Arc<VmInstance>> {
        self.vms
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(format!("sandbox not found: {id}")))
    }

    pub async fn list(&self) -> Vec<SandboxSummary> {
        let vms = self.vms.lock().await;
        let mut out = Vec::with_capacity(vms.len());
        for vm in vms.values() {
            out.push(vm.summary().await);
        }
        out
    }

    pub fn is_tap_available(&self, id: &str) -> bool {
        self.subnet.can_allocate_specific(&self.subnet.tap_name(self.subnet.deterministic_block(id)))
    }

    pub async fn agent(&self, id: &str) -> SandboxResult<Arc<AgentClient>> {
        self.get(id).await?.agent().await
    }

    pub async fn sync_fs(&self, id: &str, timeout: Duration) -> SandboxResult<()> {
        self.get(id).await?.agent().await?.sync_fs(timeout).await
    }

    /// Spec §4.8 Create.
    pub async fn create(&self, req: CreateSandboxReq) -> SandboxResult<SandboxHandle> {
        let id = ids::new_sandbox_id();
        let sandbox_dir = self.config.sandbox_dir(&id);
        tokio::fs::create_dir_all(&sandbox_dir).await?;

        let mut unwind = Unwind::default();
        match self.create_inner(&id, &sandbox_dir, req, &mut unwind).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                tracing::warn!(sandbox_id = %id, error = %e, "create failed, unwinding partial resources");
                unwind.run(&self.hostnet, &self.subnet, &sandbox_dir, true).await;
                Err(e)
            }
        }
    }

    async fn create_inner(
        &self,
        id: &str,
        sandbox_dir: &Path,
        req: CreateSandboxReq,
        unwind: &mut Unwind,
    ) -> SandboxResult<SandboxHandle> {
        let cpu_count = req.cpu_count.unwrap_or(self.config.default_cpu_count);
        let memory_mib = req.memory_mib.unwrap_or(self.config.default_memory_mib);
        let guest_port = req.guest_port.unwrap_or(self.config.default_guest_port);

        let rootfs_path = sandbox_dir.join("rootfs.ext4");
        let workspace_path = sandbox_dir.join("workspace.ext4");

        match &req.template_rootfs_source {
            Some(src) => drives::reflink_copy(Path::new(src), &rootfs_path).await?,
            None => {
                let base = drives::resolve_base_image(&self.config.images_dir, &req.template).await?;
                drives::prepare_rootfs(&base, &rootfs_path).await?;
            }
        }
        match &req.template_workspace_source {
            Some(src) => drives::reflink_copy(Path::new(src), &workspace_path).await?,
            None => drives::create_workspace(&workspace_path, self.config.default_disk_mib).await?,
        }

        let block = self.subnet.deterministic_block(id);
        let alloc = self.subnet.allocate_block(block).map_err(|_| {
            SandboxError::PreconditionFailed(format!("sandbox id collision: block {block} already in use on this worker"))
        })?;
        unwind.subnet_block = Some(block);

        self.hostnet.create_tap(&alloc).await.map_err(|e| SandboxError::ResourceExhausted(e.to_string()))?;
        unwind.tap = Some(alloc.tap_name.clone());

        let host_port = self.hostnet.find_free_port().await.map_err(|e| SandboxError::ResourceExhausted(e.to_string()))?;
        let dnat_added = self
            .hostnet
            .add_dnat(&alloc, host_port, guest_port)
            .await
            .map_err(|e| SandboxError::ResourceExhausted(e.to_string()))?;
        if dnat_added {
            unwind.dnat = Some((alloc.clone(), host_port, guest_port));
        }
        self.hostnet
            .enable_forwarding(&format!("{}.0.0.0/8", self.config.subnet_prefix_octet))
            .await
            .map_err(|e| SandboxError::ResourceExhausted(e.to_string()))?;

        let guest_cid = self.next_cid.fetch_add(1, Ordering::SeqCst);
        let guest_mac = ids::mac_to_string(ids::mac_for(id));
        let boot_args = boot_args_for(&alloc);

        let hypervisor_sock = sandbox_dir.join("hypervisor.sock");
        let vsock_sock = sandbox_dir.join("vsock.sock");
        let hypervisor_log = sandbox_dir.join("hypervisor.log");

        let mut child = spawn_hypervisor(&self.config.hypervisor_bin, &hypervisor_sock, &hypervisor_log).await?;
        unwind.hypervisor = child.id();

        let hv = HypervisorClient::new(&hypervisor_sock);
        let result: SandboxResult<()> = async {
            hv.wait_for_socket(HYPERVISOR_SOCKET_TIMEOUT).await?;
            hv.set_machine_config(cpu_count, memory_mib).await?;
            hv.set_boot_source(&self.config.kernel_path.to_string_lossy(), &boot_args).await?;
            hv.attach_drive("rootfs", &rootfs_path, true, false).await?;
            hv.attach_drive("workspace", &workspace_path, false, false).await?;
            hv.attach_nic("eth0", &guest_mac, &alloc.tap_name).await?;
            hv.attach_vsock(guest_cid, &vsock_sock).await?;
            hv.start_instance().await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            let _ = kill_process(&mut child).await;
            return Err(e);
        }

        let agent = wait_for_agent_ready(vsock_sock.clone()).await;
        let agent = match agent {
            Ok(a) => a,
            Err(e) => {
                let _ = kill_process(&mut child).await;
                return Err(e);
            }
        };

        let timeout_seconds = if req.timeout_seconds == 0 { self.config.default_idle_timeout_secs } else { req.timeout_seconds };
        let started_at = Utc::now();
        let end_at = started_at + chrono::Duration::seconds(timeout_seconds as i64);

        persist_sandbox_meta(
            sandbox_dir,
            &SandboxMeta { id: id.to_string(), template: req.template.clone(), cpu_count, memory_mib, guest_port },
        )
        .await?;

        let instance = Arc::new(VmInstance {
            id: id.to_string(),
            template: req.template,
            status: AsyncMutex::new(SandboxStatus::Running),
            started_at,
            end_at: AsyncMutex::new(end_at),
            cpu_count,
            memory_mib,
            guest_port,
            host_port: AsyncMutex::new(host_port),
            network: AsyncMutex::new(alloc),
            guest_cid: AsyncMutex::new(guest_cid),
            guest_mac,
            sandbox_dir: sandbox_dir.to_path_buf(),
            vsock_sock: AsyncMutex::new(vsock_sock),
            hypervisor: AsyncMutex::new(Some(child)),
            agent: AsyncMutex::new(Some(Arc::new(agent))),
            dnat_installed: AsyncMutex::new(dnat_added),
        });
        self.vms.lock().await.insert(id.to_string(), instance.clone());
        unwind.clear();

        tracing::info!(sandbox_id = %id, %host_port, "sandbox created");
        Ok(SandboxHandle {
            id: id.to_string(),
            status: SandboxStatus::Running,
            started_at,
            end_at,
            cpu_count,
            memory_mib,
            host_port,
        })
    }

    /// Spec §4.8 Kill.
    pub async fn kill(&self, id: &str) -> SandboxResult<()> {
        let instance = {
            let mut vms = self.vms.lock().await;
            vms.remove(id).ok_or_else(|| SandboxError::NotFound(format!("sandbox not found: {id}")))?
        };

        if let Some(agent) = instance.agent.lock().await.take() {
            if let Err(e) = agent.shutdown(AGENT_SHUTDOWN_TIMEOUT).await {
                tracing::warn!(sandbox_id = %id, error = %e, "agent shutdown failed during kill, continuing");
            }
        }
        if let Some(mut child) = instance.hypervisor.lock().await.take() {
            let _ = kill_process(&mut child).await;
        }

        let network = instance.network.lock().await.clone();
        let host_port = *instance.host_port.lock().await;
        if *instance.dnat_installed.lock().await {
            let _ = self.hostnet.remove_dnat(&network, host_port, instance.guest_port).await;
        }
        let _ = self.hostnet.delete_tap(&network.tap_name).await;
        self.subnet.release(network.block);

        let _ = tokio::fs::remove_file(instance.hypervisor_sock()).await;
        let _ = tokio::fs::remove_file(&*instance.vsock_sock.lock().await).await;
        let _ = tokio::fs::remove_dir_all(&instance.sandbox_dir).await;

        tracing::info!(sandbox_id = %id, "sandbox killed");
        Ok(())
    }

    /// Spec §4.8 Hibernate.
    pub async fn hibernate(&self, id: &str) -> SandboxResult<HibernateResp> {
        let instance = self.get(id).await?;
        if *instance.status.lock().await != SandboxStatus::Running {
            return Err(SandboxError::PreconditionFailed(format!("sandbox {id} is not running")));
        }

        if let Some(agent) = instance.agent.lock().await.as_ref() {
            if let Err(e) = agent.sync_fs(SYNC_FS_TIMEOUT).await {
                tracing::warn!(sandbox_id = %id, error = %e, "pre-hibernate sync-fs failed, continuing");
            }
        }
        // Vsock multiplexer must be idle at snapshot time.
        instance.agent.lock().await.take();

        let hv = HypervisorClient::new(instance.hypervisor_sock());
        hv.pause().await?;

        let snapshot_dir = instance.sandbox_dir.join("snapshot");
        let snapshot_result: SandboxResult<()> = async {
            tokio::fs::create_dir_all(&snapshot_dir).await?;
            let vmstate_path = snapshot_dir.join("vmstate");
            let mem_path = snapshot_dir.join("mem");
            hv.create_snapshot(&vmstate_path, &mem_path).await?;
            Ok(())
        }
        .await;
        if let Err(e) = snapshot_result {
            // The VM is paused but not durably snapshotted; best-effort
            // resume so the caller isn't left with a frozen-but-unsaved VM.
            if let Err(resume_err) = hv.resume().await {
                tracing::warn!(sandbox_id = %id, error = %resume_err, "best-effort resume after failed snapshot also failed");
            }
            return Err(e);
        }

        if let Some(mut child) = instance.hypervisor.lock().await.take() {
            let _ = kill_process(&mut child).await;
        }

        let network = instance.network.lock().await.clone();
        let guest_cid = *instance.guest_cid.lock().await;
        let vsock_sock = instance.vsock_sock.lock().await.clone();
        let meta = SnapshotMeta {
            sandbox_id: id.to_string(),
            network: network.clone(),
            guest_cid,
            guest_mac: instance.guest_mac.clone(),
            boot_args: boot_args_for(&network),
            rootfs_path: instance.rootfs_path().to_string_lossy().into_owned(),
            workspace_path: instance.workspace_path().to_string_lossy().into_owned(),
            vsock_socket_path: vsock_sock.to_string_lossy().into_owned(),
            cpu_count: instance.cpu_count,
            memory_mib: instance.memory_mib,
            template: instance.template.clone(),
            guest_port: instance.guest_port,
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|e| SandboxError::ArchiveFailure(format!("failed to encode snapshot meta: {e}")))?;
        tokio::fs::write(snapshot_dir.join("meta.json"), meta_bytes).await?;

        let host_port = *instance.host_port.lock().await;
        if *instance.dnat_installed.lock().await {
            let _ = self.hostnet.remove_dnat(&network, host_port, instance.guest_port).await;
        }
        let _ = self.hostnet.delete_tap(&network.tap_name).await;
        self.subnet.release(network.block);
        let _ = tokio::fs::remove_file(instance.hypervisor_sock()).await;
        let _ = tokio::fs::remove_file(&vsock_sock).await;

        self.vms.lock().await.remove(id);

        let checkpoint_key = format!("checkpoints/{id}/{}.tar.zst", Utc::now().timestamp());
        self.spawn_upload(
            instance.sandbox_dir.clone(),
            checkpoint_key.clone(),
            vec!["snapshot/mem", "snapshot/vmstate", "snapshot/meta.json", "workspace.ext4"],
        );

        tracing::info!(sandbox_id = %id, %checkpoint_key, "sandbox hibernated");
        Ok(HibernateResp { sandbox_id: id.to_string(), checkpoint_key, size_bytes: 0 })
    }

    fn spawn_upload(&self, sandbox_dir: PathBuf, checkpoint_key: String, rel_paths: Vec<&'static str>) {
        let object_store = self.object_store.clone();
        let inflight = self.inflight_uploads.clone();
        let idle = self.uploads_idle.clone();
        inflight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let archive_path = sandbox_dir.join("checkpoint-upload.tar.zst");
            let result: SandboxResult<()> = async {
                archiver::build_standard_archive(&sandbox_dir, &rel_paths, &archive_path).await?;
                tokio::time::timeout(UPLOAD_TIMEOUT, object_store.upload(&checkpoint_key, &archive_path))
                    .await
                    .map_err(|_| SandboxError::DeadlineExceeded)??;
                tokio::fs::remove_file(&archive_path).await?;
                Ok(())
            }
            .await;
            if let Err(e) = result {
                tracing::error!(%checkpoint_key, error = %e, "checkpoint upload failed; snapshot remains valid on local disk");
            }
            if inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });
    }

    /// Blocks until no checkpoint/template upload is in flight, or `timeout`
    /// elapses. Used for graceful shutdown.
    pub async fn wait_uploads(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.uploads_idle.notified();
                if self.inflight_uploads.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    /// Spec §4.8 Wake.
    pub async fn wake(&self, id: &str, req: WakeReq) -> SandboxResult<SandboxHandle> {
        let sandbox_dir = self.config.sandbox_dir(id);
        let snapshot_dir = sandbox_dir.join("snapshot");

        let have_snapshot = tokio::fs::try_exists(snapshot_dir.join("mem")).await.unwrap_or(false)
            && tokio::fs::try_exists(snapshot_dir.join("vmstate")).await.unwrap_or(false)
            && tokio::fs::try_exists(snapshot_dir.join("meta.json")).await.unwrap_or(false);

        if !have_snapshot {
            let key = req
                .checkpoint_key
                .clone()
                .ok_or_else(|| SandboxError::PreconditionFailed("wake requires a checkpoint-key when no local snapshot exists".into()))?;
            tokio::fs::create_dir_all(&sandbox_dir).await?;
            let archive_path = sandbox_dir.join("checkpoint-download.tar.zst");
            self.object_store.download(&key, &archive_path).await?;
            archiver::extract_standard_archive(&archive_path, &sandbox_dir).await?;
            let _ = tokio::fs::remove_file(&archive_path).await;
        }

        let meta_bytes = tokio::fs::read(snapshot_dir.join("meta.json")).await.map_err(|e| {
            SandboxError::PreconditionFailed(format!("snapshot meta unreadable for {id}: {e}"))
        })?;
        let meta: SnapshotMeta = serde_json::from_slice(&meta_bytes)
            .map_err(|e| SandboxError::ArchiveFailure(format!("malformed snapshot meta for {id}: {e}")))?;

        let rootfs_path = sandbox_dir.join("rootfs.ext4");
        let workspace_path = sandbox_dir.join("workspace.ext4");
        if !tokio::fs::try_exists(&rootfs_path).await.unwrap_or(false) {
            let base = drives::resolve_base_image(&self.config.images_dir, &meta.template).await?;
            drives::prepare_rootfs(&base, &rootfs_path).await?;
        }
        if !tokio::fs::try_exists(&workspace_path).await.unwrap_or(false) {
            return Err(SandboxError::PreconditionFailed(format!(
                "workspace drive missing for {id}: archive is incompatible (pre-workspace-inclusion layout)"
            )));
        }

        let vsock_basename = Path::new(&meta.vsock_socket_path)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| std::ffi::OsString::from("vsock.sock"));
        let vsock_sock = sandbox_dir.join(vsock_basename);
        let hypervisor_sock = sandbox_dir.join("hypervisor.sock");
        let hypervisor_log = sandbox_dir.join("hypervisor.log");

        let mut unwind = Unwind::default();
        let hot_path = self.subnet.can_allocate_specific(&meta.network.tap_name);

        let (alloc, guest_cid, guest_mac, boot_args, hot) = if hot_path {
            let alloc = self.subnet.allocate_specific(&meta.network.tap_name)?;
            (alloc, meta.guest_cid, meta.guest_mac.clone(), meta.boot_args.clone(), true)
        } else {
            let alloc = self.subnet.allocate()?;
            let guest_cid = self.next_cid.fetch_add(1, Ordering::SeqCst);
            let guest_mac = ids::mac_to_string(ids::mac_for(id));
            let boot_args = boot_args_for(&alloc);
            (alloc, guest_cid, guest_mac, boot_args, false)
        };
        unwind.subnet_block = Some(alloc.block);

        let wake_result: SandboxResult<(Child, u16, bool)> = async {
            self.hostnet.create_tap(&alloc).await.map_err(|e| SandboxError::ResourceExhausted(e.to_string()))?;
            unwind.tap = Some(alloc.tap_name.clone());
            let host_port = self.hostnet.find_free_port().await.map_err(|e| SandboxError::ResourceExhausted(e.to_string()))?;
            let dnat_added = self
                .hostnet
                .add_dnat(&alloc, host_port, meta.guest_port)
                .await
                .map_err(|e| SandboxError::ResourceExhausted(e.to_string()))?;
            if dnat_added {
                unwind.dnat = Some((alloc.clone(), host_port, meta.guest_port));
            }

            let mut child = spawn_hypervisor(&self.config.hypervisor_bin, &hypervisor_sock, &hypervisor_log).await?;
            unwind.hypervisor = child.id();
            let hv = HypervisorClient::new(&hypervisor_sock);
            hv.wait_for_socket(HYPERVISOR_SOCKET_TIMEOUT).await?;

            if hot {
                hv.attach_vsock(guest_cid, &vsock_sock).await?;
                hv.load_snapshot(&snapshot_dir.join("vmstate"), &snapshot_dir.join("mem"), true).await?;
            } else {
                hv.set_machine_config(meta.cpu_count, meta.memory_mib).await?;
                hv.set_boot_source(&self.config.kernel_path.to_string_lossy(), &boot_args).await?;
                hv.attach_drive("rootfs", &rootfs_path, true, false).await?;
                hv.attach_drive("workspace", &workspace_path, false, false).await?;
                hv.attach_nic("eth0", &guest_mac, &alloc.tap_name).await?;
                hv.attach_vsock(guest_cid, &vsock_sock).await?;
                hv.start_instance().await?;
            }
            Ok((child, host_port, dnat_added))
        }
        .await;

        let (mut child, host_port, dnat_added) = match wake_result {
            Ok(v) => v,
            Err(e) => {
                // Network/process resources only; the sandbox's snapshot and
                // drives in `sandbox_dir` must survive a failed wake attempt.
                unwind.run(&self.hostnet, &self.subnet, &sandbox_dir, false).await;
                return Err(e);
            }
        };

        let agent = match wait_for_agent_ready(vsock_sock.clone()).await {
            Ok(a) => a,
            Err(e) => {
                let _ = kill_process(&mut child).await;
                unwind.run(&self.hostnet, &self.subnet, &sandbox_dir, false).await;
                return Err(e);
            }
        };

        let timeout_seconds = if req.timeout_seconds == 0 { DEFAULT_WAKE_TIMEOUT_SECS } else { req.timeout_seconds };
        let started_at = Utc::now();
        let end_at = started_at + chrono::Duration::seconds(timeout_seconds as i64);

        persist_sandbox_meta(
            &sandbox_dir,
            &SandboxMeta { id: id.to_string(), template: meta.template.clone(), cpu_count: meta.cpu_count, memory_mib: meta.memory_mib, guest_port: meta.guest_port },
        )
        .await?;

        let instance = Arc::new(VmInstance {
            id: id.to_string(),
            template: meta.template,
            status: AsyncMutex::new(SandboxStatus::Running),
            started_at,
            end_at: AsyncMutex::new(end_at),
            cpu_count: meta.cpu_count,
            memory_mib: meta.memory_mib,
            guest_port: meta.guest_port,
            host_port: AsyncMutex::new(host_port),
            network: AsyncMutex::new(alloc),
            guest_cid: AsyncMutex::new(guest_cid),
            guest_mac,
            sandbox_dir: sandbox_dir.clone(),
            vsock_sock: AsyncMutex::new(vsock_sock),
            hypervisor: AsyncMutex::new(Some(child)),
            agent: AsyncMutex::new(Some(Arc::new(agent))),
            dnat_installed: AsyncMutex::new(dnat_added),
        });
        self.vms.lock().await.insert(id.to_string(), instance.clone());
        unwind.clear();

        tracing::info!(sandbox_id = %id, hot_restore = hot, "sandbox woken");
        Ok(SandboxHandle {
            id: id.to_string(),
            status: SandboxStatus::Running,
            started_at,
            end_at,
            cpu_count: instance.cpu_count,
            memory_mib: instance.memory_mib,
            host_port,
        })
    }

    /// Spec §4.8 SaveAsTemplate.
    pub async fn save_as_template<F>(&self, id: &str, req: SaveAsTemplateReq, on_complete: F) -> SandboxResult<()>
    where
        F: FnOnce(SandboxResult<()>) + Send + 'static,
    {
        let instance = self.get(id).await?;
        let hv = HypervisorClient::new(instance.hypervisor_sock());
        hv.pause().await?;

        let staging_dir = self.config.template_dir(&req.template_id);
        let result = async {
            tokio::fs::create_dir_all(&staging_dir).await?;
            drives::reflink_copy(&instance.rootfs_path(), &staging_dir.join("rootfs.ext4")).await?;
            drives::reflink_copy(&instance.workspace_path(), &staging_dir.join("workspace.ext4")).await?;
            Ok::<_, SandboxError>(())
        }
        .await;

        hv.resume().await?;
        result?;

        let object_store = self.object_store.clone();
        let inflight = self.inflight_uploads.clone();
        let idle = self.uploads_idle.clone();
        let template_id = req.template_id.clone();
        inflight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let upload_result: SandboxResult<()> = async {
                let rootfs_archive = staging_dir.join("rootfs.tar.zst");
                archiver::build_standard_archive(&staging_dir, &["rootfs.ext4"], &rootfs_archive).await?;
                object_store.upload(&format!("templates/{template_id}/rootfs.tar.zst"), &rootfs_archive).await?;
                tokio::fs::remove_file(&rootfs_archive).await?;

                let workspace_archive = staging_dir.join("workspace.sparse.zst");
                archiver::build_sparse_archive(&staging_dir.join("workspace.ext4"), &workspace_archive).await?;
                object_store.upload(&format!("templates/{template_id}/workspace.sparse.zst"), &workspace_archive).await?;
                tokio::fs::remove_file(&workspace_archive).await?;
                Ok(())
            }
            .await;
            on_complete(upload_result);
            if inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });
        Ok(())
    }
}

#[derive(Default)]
struct Unwind {
    subnet_block: Option<u32>,
    tap: Option<String>,
    dnat: Option<(NetworkAllocation, u16, u16)>,
    hypervisor: Option<u32>,
}

impl Unwind {
    fn clear(&mut self) {
        self.subnet_block = None;
        self.tap = None;
        self.dnat = None;
        self.hypervisor = None;
    }

    /// Releases every network/process resource this unwind tracked. Only
    /// `create()` passes `remove_dir = true`: its `sandbox_dir` was just
    /// created empty for this attempt. `wake()` reuses the sandbox's
    /// persistent directory (snapshot, workspace, rootfs), which must
    /// survive a failed wake attempt per spec §3/§7 — a transient hypervisor
    /// or agent-readiness failure must not destroy the only local copy of
    /// the checkpoint.
    async fn run(&self, hostnet: &HostNetProgrammer, subnet: &SubnetAllocator, sandbox_dir: &Path, remove_dir: bool) {
        if let Some(pid) = self.hypervisor {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        if let Some((alloc, host_port, guest_port)) = &self.dnat {
            let _ = hostnet.remove_dnat(alloc, *host_port, *guest_port).await;
        }
        if let Some(tap) = &self.tap {
            let _ = hostnet.delete_tap(tap).await;
        }
        if let Some(block) = self.subnet_block {
            subnet.release(block);
        }
        if remove_dir {
            let _ = tokio::fs::remove_dir_all(sandbox_dir).await;
        }
    }
}

fn boot_args_for(alloc: &NetworkAllocation) -> String {
    format!(
        "console=ttyS0 reboot=k panic=1 pci=off ip={}::{}:{}::eth0:off init=/sbin/init",
        alloc.guest_ip,
        alloc.host_ip,
        NetworkAllocation::NETMASK,
    )
}

async fn persist_sandbox_meta(sandbox_dir: &Path, meta: &SandboxMeta) -> SandboxResult<()> {
    let bytes = serde_json::to_vec_pretty(meta)
        .map_err(|e| SandboxError::ArchiveFailure(format!("failed to encode sandbox meta: {e}")))?;
    tokio::fs::write(sandbox_dir.join("sandbox-meta.json"), bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_alloc() -> NetworkAllocation {
        NetworkAllocation {
            block: 7,
            host_ip: Ipv4Addr::new(10, 0, 0, 29),
            guest_ip: Ipv4Addr::new(10, 0, 0, 30),
            tap_name: "wk-tap7".into(),
        }
    }

    #[test]
    fn boot_args_carries_static_guest_network_config() {
        let args = boot_args_for(&sample_alloc());
        assert!(args.starts_with("console=ttyS0 reboot=k panic=1 pci=off "));
        assert!(args.contains("ip=10.0.0.30::10.0.0.29:255.255.255.252::eth0:off"));
        assert!(args.contains("init=/sbin/init"));
    }

    #[tokio::test]
    async fn persist_sandbox_meta_writes_readable_json() {
        let dir = tempfile::tempdir().unwrap();
        let meta = SandboxMeta { id: "sbx-1".into(), template: "base".into(), cpu_count: 2, memory_mib: 512, guest_port: 80 };
        persist_sandbox_meta(dir.path(), &meta).await.unwrap();

        let bytes = tokio::fs::read(dir.path().join("sandbox-meta.json")).await.unwrap();
        let round_tripped: SandboxMeta = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(round_tripped.id, "sbx-1");
        assert_eq!(round_tripped.cpu_count, 2);
    }

    #[tokio::test]
    async fn unwind_run_removes_sandbox_dir_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox_dir = dir.path().join("sbx-2");
        tokio::fs::create_dir_all(&sandbox_dir).await.unwrap();

        let subnet = SubnetAllocator::new(10, 1 << 16, "wk");
        let hostnet = HostNetProgrammer::new(None);
        let unwind = Unwind::default();
        unwind.run(&hostnet, &subnet, &sandbox_dir, true).await;

        assert!(!sandbox_dir.exists());
    }

    #[tokio::test]
    async fn unwind_run_preserves_sandbox_dir_when_not_requested() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox_dir = dir.path().join("sbx-3");
        tokio::fs::create_dir_all(&sandbox_dir).await.unwrap();

        let subnet = SubnetAllocator::new(10, 1 << 16, "wk");
        let hostnet = HostNetProgrammer::new(None);
        let unwind = Unwind::default();
        unwind.run(&hostnet, &subnet, &sandbox_dir, false).await;

        assert!(sandbox_dir.exists());
    }

    #[test]
    fn unwind_clear_resets_every_field() {
        let mut unwind = Unwind {
            subnet_block: Some(3),
            tap: Some("wk-tap3".into()),
            dnat: Some((sample_alloc(), 8080, 80)),
            hypervisor: Some(1234),
        };
        unwind.clear();
        assert!(unwind.subnet_block.is_none());
        assert!(unwind.tap.is_none());
        assert!(unwind.dnat.is_none());
        assert!(unwind.hypervisor.is_none());
    }
}

async fn spawn_hypervisor(bin: &str, api_sock: &Path, log_path: &Path) -> SandboxResult<Child> {
    if let Some(parent) = api_sock.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let _ = tokio::fs::remove_file(api_sock).await;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| SandboxError::HypervisorFailure { status: 0, body: format!("failed to open {}: {e}", log_path.display()) })?;
    let log_file_err = log_file.try_clone().map_err(|e| SandboxError::HypervisorFailure { status: 0, body: e.to_string() })?;

    Command::new(bin)
        .arg("--api-sock")
        .arg(api_sock)
        .stdout(log_file)
        .stderr(log_file_err)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SandboxError::HypervisorFailure { status: 0, body: format!("failed to spawn {bin}: {e}") })
}

/// Sends SIGTERM, waits briefly, then SIGKILL if the process hasn't exited
/// (spec §9 subprocess management note). Always waits so the OS process
/// table entry does not leak.
async fn kill_process(child: &mut Child) -> std::io::Result<()> {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(Duration::from_secs(2), child.wait()).await.is_err() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
    let _ = child.wait().await;
    Ok(())
}

/// Polls the agent's control port on an independent task so a short caller
/// deadline cannot cut agent warm-up short (spec §4.8 step 7).
async fn wait_for_agent_ready(vsock_sock: PathBuf) -> SandboxResult<AgentClient> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now();
        loop {
            if let Ok(client) = AgentClient::connect(&vsock_sock).await {
                if client.ping().await.is_ok() {
                    return Ok(client);
                }
            }
            if start.elapsed() >= AGENT_READY_TIMEOUT {
                return Err(SandboxError::AgentUnreachable("agent did not become ready within 30s".into()));
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
    })
    .await
    .map_err(|e| SandboxError::AgentUnreachable(format!("agent readiness task panicked: {e}")))?
}
