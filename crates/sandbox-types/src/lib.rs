//! Wire types shared between the worker's RPC surface and its internal
//! components: sandbox identifiers, network allocations, on-disk metadata
//! records, and the error taxonomy every component reports through.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Short opaque sandbox identifier, e.g. `sbx-a1b2c3d4`. Globally unique
/// within the deployment; see `worker::core::ids` for the generator.
pub type SandboxId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Running,
    Paused,
    Hibernated,
    Destroyed,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Hibernated => "hibernated",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// A reserved /30 block, encoded as its block index plus the derived host
/// and guest addresses. See spec §4.1 for the derivation function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAllocation {
    pub block: u32,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub tap_name: String,
}

impl NetworkAllocation {
    pub const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 252);
}

/// Persisted at `<sandbox-dir>/snapshot/meta.json`. Field names are part of
/// the on-disk contract (spec §3, §6) and must not be renamed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    #[serde(rename = "sandbox-id")]
    pub sandbox_id: SandboxId,
    pub network: NetworkAllocation,
    #[serde(rename = "guest-cid")]
    pub guest_cid: u32,
    #[serde(rename = "guest-mac")]
    pub guest_mac: String,
    #[serde(rename = "boot-args")]
    pub boot_args: String,
    #[serde(rename = "rootfs-path")]
    pub rootfs_path: String,
    #[serde(rename = "workspace-path")]
    pub workspace_path: String,
    #[serde(rename = "vsock-socket-path")]
    pub vsock_socket_path: String,
    #[serde(rename = "cpu-count")]
    pub cpu_count: u8,
    #[serde(rename = "memory-mib")]
    pub memory_mib: u32,
    pub template: String,
    #[serde(rename = "guest-port")]
    pub guest_port: u16,
}

/// Persisted at `<sandbox-dir>/sandbox-meta.json`; enough to cold-boot a
/// sandbox with no full snapshot present (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxMeta {
    pub id: SandboxId,
    pub template: String,
    #[serde(rename = "cpu-count")]
    pub cpu_count: u8,
    #[serde(rename = "memory-mib")]
    pub memory_mib: u32,
    #[serde(rename = "guest-port")]
    pub guest_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSandboxReq {
    pub template: String,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub cpu_count: Option<u8>,
    #[serde(default)]
    pub memory_mib: Option<u32>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub guest_port: Option<u16>,
    #[serde(default)]
    pub template_rootfs_source: Option<String>,
    #[serde(default)]
    pub template_workspace_source: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxHandle {
    pub id: SandboxId,
    pub status: SandboxStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub end_at: chrono::DateTime<chrono::Utc>,
    pub cpu_count: u8,
    pub memory_mib: u32,
    pub host_port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxSummary {
    pub id: SandboxId,
    pub template: String,
    pub status: SandboxStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub end_at: chrono::DateTime<chrono::Utc>,
    pub cpu_count: u8,
    pub memory_mib: u32,
    pub host_port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListSandboxesResp {
    pub items: Vec<SandboxSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecCommandReq {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default = "default_exec_timeout")]
    pub timeout_seconds: u64,
}

fn default_exec_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecCommandResp {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilePathReq {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteFileReq {
    pub path: String,
    pub data_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDirResp {
    pub entries: Vec<DirEntryInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatResp {
    pub exists: bool,
    pub is_dir: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxStats {
    pub cpu_percent: f64,
    pub mem_usage_bytes: u64,
    pub mem_limit_bytes: u64,
    pub net_in_bytes: u64,
    pub net_out_bytes: u64,
    pub pids: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HibernateResp {
    pub sandbox_id: SandboxId,
    pub checkpoint_key: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WakeReq {
    pub checkpoint_key: Option<String>,
    #[serde(default)]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveAsTemplateReq {
    pub template_id: String,
}

/// Error kinds the core produces (spec §7). `Io` is not part of the
/// public taxonomy spec.md enumerates; it is an internal catch-all for
/// unexpected filesystem/IO failures that callers never need to branch
/// on, and it maps to the same 500-class response any other unexpected
/// failure would.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("hypervisor failure: {status} {body}")]
    HypervisorFailure { status: u16, body: String },
    #[error("agent unreachable: {0}")]
    AgentUnreachable(String),
    #[error("archive failure: {0}")]
    ArchiveFailure(String),
    #[error("object store failure: {0}")]
    ObjectStoreFailure(String),
    #[error("cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Stable label for metrics/log fields; one per spec §7 kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::HypervisorFailure { .. } => "hypervisor_failure",
            Self::AgentUnreachable(_) => "agent_unreachable",
            Self::ArchiveFailure(_) => "archive_failure",
            Self::ObjectStoreFailure(_) => "object_store_failure",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Io(_) => "io",
        }
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
