//! Hypervisor Control Client (spec §4.3): a thin RPC client over the
//! per-VM API Unix-domain socket. The transport is lifted directly from
//! the teacher's `core/uds_proxy.rs` — `hyper` + `hyperlocal::Uri` against
//! a `hyper_util` legacy client bound to a `UnixConnector`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyperlocal::UnixConnector;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use sandbox_types::{SandboxError, SandboxResult};
use serde_json::json;

pub struct HypervisorClient {
    sock_path: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl HypervisorClient {
    pub fn new(sock_path: impl Into<PathBuf>) -> Self {
        Self {
            sock_path: sock_path.into(),
            client: Client::builder(TokioExecutor::new()).build(UnixConnector),
        }
    }

    /// Polls until the API socket file exists, or `timeout` elapses.
    pub async fn wait_for_socket(&self, timeout: Duration) -> SandboxResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.sock_path.exists() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SandboxError::HypervisorFailure {
                    status: 0,
                    body: format!("api socket {} never appeared", self.sock_path.display()),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn call(&self, method: Method, path: &str, body: serde_json::Value) -> SandboxResult<()> {
        let uri = hyperlocal::Uri::new(&self.sock_path, path);
        let payload = serde_json::to_vec(&body).unwrap_or_default();
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| SandboxError::HypervisorFailure { status: 0, body: e.to_string() })?;

        let res = self.client.request(req).await.map_err(|e| SandboxError::HypervisorFailure {
            status: 0,
            body: e.to_string(),
        })?;
        let status = res.status();
        let body_bytes = res
            .into_body()
            .collect()
            .await
            .map_err(|e| SandboxError::HypervisorFailure { status: status.as_u16(), body: e.to_string() })?
            .to_bytes();
        if !status.is_success() {
            return Err(SandboxError::HypervisorFailure {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body_bytes).into_owned(),
            });
        }
        Ok(())
    }

    pub async fn set_machine_config(&self, vcpu_count: u8, mem_size_mib: u32) -> SandboxResult<()> {
        self.call(
            Method::PUT,
            "/machine-config",
            json!({"vcpu_count": vcpu_count, "mem_size_mib": mem_size_mib}),
        )
        .await
    }

    pub async fn set_boot_source(&self, kernel_path: &str, boot_args: &str) -> SandboxResult<()> {
        self.call(
            Method::PUT,
            "/boot-source",
            json!({"kernel_image_path": kernel_path, "boot_args": boot_args}),
        )
        .await
    }

    pub async fn attach_drive(&self, id: &str, path: &Path, is_root: bool, read_only: bool) -> SandboxResult<()> {
        self.call(
            Method::PUT,
            &format!("/drives/{id}"),
            json!({
                "drive_id": id,
                "path_on_host": path,
                "is_root_device": is_root,
                "is_read_only": read_only,
            }),
        )
        .await
    }

    pub async fn attach_nic(&self, id: &str, mac: &str, tap_name: &str) -> SandboxResult<()> {
        self.call(
            Method::PUT,
            &format!("/network-interfaces/{id}"),
            json!({"iface_id": id, "guest_mac": mac, "host_dev_name": tap_name}),
        )
        .await
    }

    pub async fn attach_vsock(&self, guest_cid: u32, uds_path: &Path) -> SandboxResult<()> {
        self.call(
            Method::PUT,
            "/vsock",
            json!({"guest_cid": guest_cid, "uds_path": uds_path, "vsock_id": "vsock0"}),
        )
        .await
    }

    pub async fn start_instance(&self) -> SandboxResult<()> {
        self.call(Method::PUT, "/actions", json!({"action_type": "InstanceStart"})).await
    }

    pub async fn pause(&self) -> SandboxResult<()> {
        self.call(Method::PATCH, "/vm", json!({"state": "Paused"})).await
    }

    pub async fn resume(&self) -> SandboxResult<()> {
        self.call(Method::PATCH, "/vm", json!({"state": "Resumed"})).await
    }

    pub async fn create_snapshot(&self, vmstate_path: &Path, mem_path: &Path) -> SandboxResult<()> {
        self.call(
            Method::PUT,
            "/snapshot/create",
            json!({"snapshot_path": vmstate_path, "mem_file_path": mem_path, "snapshot_type": "Full"}),
        )
        .await
    }

    pub async fn load_snapshot(&self, vmstate_path: &Path, mem_path: &Path, resume: bool) -> SandboxResult<()> {
        self.call(
            Method::PUT,
            "/snapshot/load",
            json!({
                "snapshot_path": vmstate_path,
                "mem_backend": {"backend_path": mem_path, "backend_type": "File"},
                "resume_vm": resume,
            }),
        )
        .await
    }
}
