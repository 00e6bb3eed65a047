//! Worker configuration: environment-variable driven, following the
//! teacher's `main.rs` `std::env::var(...).unwrap_or_else(...)` pattern.
//! No config-file crate is introduced.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub bind: String,
    pub data_dir: PathBuf,
    pub kernel_path: PathBuf,
    pub images_dir: PathBuf,
    pub hypervisor_bin: String,
    pub default_memory_mib: u32,
    pub default_cpu_count: u8,
    pub default_disk_mib: u32,
    pub default_guest_port: u16,
    pub subnet_prefix_octet: u8,
    pub subnet_pool_size: u32,
    pub tap_prefix: String,
    pub egress_iface: Option<String>,
    pub object_store_url: String,
    pub cache_dir: Option<PathBuf>,
    pub default_idle_timeout_secs: u64,
    pub autosave_interval_secs: u64,
    pub autosave_concurrency: usize,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let data_dir = PathBuf::from(env_or("WORKER_DATA_DIR", "/srv/worker"));
        let cache_dir = std::env::var("WORKER_CACHE_DIR")
            .map(PathBuf::from)
            .ok()
            .or_else(|| Some(data_dir.join("checkpoints")));

        Self {
            bind: env_or("WORKER_BIND", "127.0.0.1:8090"),
            kernel_path: PathBuf::from(env_or("WORKER_KERNEL_PATH", "/srv/worker/vmlinux")),
            images_dir: PathBuf::from(env_or("WORKER_IMAGES_DIR", "/srv/worker/images")),
            hypervisor_bin: env_or("WORKER_HYPERVISOR_BIN", "firecracker"),
            default_memory_mib: env_parsed("WORKER_DEFAULT_MEMORY_MIB", 512),
            default_cpu_count: env_parsed("WORKER_DEFAULT_CPU_COUNT", 1),
            default_disk_mib: env_parsed("WORKER_DEFAULT_DISK_MIB", 1024),
            default_guest_port: env_parsed("WORKER_DEFAULT_GUEST_PORT", 80),
            subnet_prefix_octet: env_parsed("WORKER_SUBNET_PREFIX_OCTET", 10),
            // Default pool size matches spec.md's stated preference (a /8
            // split into /30s); smaller deployments can set a /16 instead
            // (spec §9 open question), as long as every worker agrees.
            subnet_pool_size: env_parsed("WORKER_SUBNET_POOL_SIZE", 1u32 << 22),
            tap_prefix: env_or("WORKER_TAP_PREFIX", "wk"),
            egress_iface: std::env::var("WORKER_EGRESS_IFACE").ok(),
            object_store_url: env_or("WORKER_OBJECT_STORE_URL", "http://127.0.0.1:9000/worker-checkpoints"),
            cache_dir,
            default_idle_timeout_secs: env_parsed("WORKER_DEFAULT_IDLE_TIMEOUT_SECS", 600),
            autosave_interval_secs: env_parsed("WORKER_AUTOSAVE_INTERVAL_SECS", 30),
            autosave_concurrency: env_parsed("WORKER_AUTOSAVE_CONCURRENCY", 10),
            data_dir,
        }
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.data_dir.join("sandboxes")
    }

    pub fn sandbox_dir(&self, id: &str) -> PathBuf {
        self.sandboxes_dir().join(id)
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.data_dir.join("templates")
    }

    pub fn template_dir(&self, template_id: &str) -> PathBuf {
        self.templates_dir().join(template_id)
    }
}
