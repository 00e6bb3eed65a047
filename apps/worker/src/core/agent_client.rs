//! Agent Client (spec §4.4): wraps a vsock byte-stream with the in-guest
//! agent's RPC protocol. The wire framing — one JSON object per line, a
//! `result`/`error` envelope in response — is this worker's own choice
//! (the agent's implementation is out of scope; only its call surface is
//! specified). Binary payloads (file contents) are base64-framed inline,
//! the same encoding the teacher already pulls in via `base64` for its
//! Docker registry auth header and user-avatar handling.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use base64::Engine;
use sandbox_types::{DirEntryInfo, ExecCommandResp, ListDirResp, SandboxError, SandboxResult, SandboxStats, StatResp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::core::vsock::{self, VsockStream};

/// Well-known guest vsock port the agent listens for control RPCs on.
pub const AGENT_CONTROL_PORT: u32 = 1024;

#[derive(Debug, Clone)]
pub struct PtySession {
    pub session_id: String,
    pub data_port: u32,
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
enum Request<'a> {
    Ping,
    Exec {
        cmd: &'a str,
        args: &'a [String],
        env: &'a HashMap<String, String>,
        cwd: Option<&'a str>,
        timeout_seconds: u64,
    },
    ReadFile { path: &'a str },
    WriteFile { path: &'a str, data_b64: String },
    ListDir { path: &'a str },
    MakeDir { path: &'a str },
    Remove { path: &'a str },
    Exists { path: &'a str },
    Stat { path: &'a str },
    Stats,
    SyncFs,
    Shutdown,
    PtyCreate { cols: u16, rows: u16, shell: &'a str },
    PtyResize { session_id: &'a str, cols: u16, rows: u16 },
    PtyKill { session_id: &'a str },
}

#[derive(Deserialize, Default)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ReadFileResult {
    data_b64: String,
}

#[derive(Deserialize)]
struct ExistsResult {
    exists: bool,
}

#[derive(Deserialize)]
struct PtyCreateResult {
    session_id: String,
    data_port: u32,
}

/// Owns one vsock connection used for every control RPC. PTY data uses a
/// freshly-dialed stream to an agent-selected port instead (spec §4.4).
pub struct AgentClient {
    control: Mutex<BufReader<VsockStream>>,
    uds_path: std::path::PathBuf,
}

impl AgentClient {
    /// Dials the agent's control port and wraps it. Does not itself wait
    /// for the agent to be ready — callers poll with `ping` first.
    pub async fn connect(uds_path: &Path) -> SandboxResult<Self> {
        let stream = vsock::dial(uds_path, AGENT_CONTROL_PORT).await?;
        Ok(Self {
            control: Mutex::new(BufReader::new(stream)),
            uds_path: uds_path.to_path_buf(),
        })
    }

    async fn call(&self, req: Request<'_>) -> SandboxResult<Value> {
        let mut line = serde_json::to_vec(&req).map_err(|e| SandboxError::AgentUnreachable(e.to_string()))?;
        line.push(b'\n');

        let mut guard = self.control.lock().await;
        guard
            .get_mut()
            .write_all(&line)
            .await
            .map_err(|e| SandboxError::AgentUnreachable(format!("agent write failed: {e}")))?;

        let mut response = String::new();
        guard
            .read_line(&mut response)
            .await
            .map_err(|e| SandboxError::AgentUnreachable(format!("agent read failed: {e}")))?;
        if response.is_empty() {
            return Err(SandboxError::AgentUnreachable("agent closed connection".into()));
        }

        let envelope: Envelope =
            serde_json::from_str(response.trim_end()).map_err(|e| SandboxError::AgentUnreachable(e.to_string()))?;
        if !envelope.ok {
            return Err(SandboxError::AgentUnreachable(
                envelope.error.unwrap_or_else(|| "agent reported failure".into()),
            ));
        }
        Ok(envelope.result)
    }

    async fn call_timeout(&self, req: Request<'_>, timeout: Duration) -> SandboxResult<Value> {
        tokio::time::timeout(timeout, self.call(req))
            .await
            .map_err(|_| SandboxError::DeadlineExceeded)?
    }

    /// Liveness probe, capped at 2s per spec §5.
    pub async fn ping(&self) -> SandboxResult<()> {
        self.call_timeout(Request::Ping, Duration::from_secs(2)).await.map(|_| ())
    }

    pub async fn exec(
        &self,
        cmd: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
        timeout_seconds: u64,
    ) -> SandboxResult<ExecCommandResp> {
        let v = self
            .call_timeout(
                Request::Exec { cmd, args, env, cwd, timeout_seconds },
                Duration::from_secs(timeout_seconds.max(1) + 5),
            )
            .await?;
        serde_json::from_value(v).map_err(|e| SandboxError::AgentUnreachable(e.to_string()))
    }

    pub async fn read_file(&self, path: &str) -> SandboxResult<Vec<u8>> {
        let v = self.call(Request::ReadFile { path }).await?;
        let r: ReadFileResult = serde_json::from_value(v).map_err(|e| SandboxError::AgentUnreachable(e.to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(r.data_b64)
            .map_err(|e| SandboxError::AgentUnreachable(format!("bad base64 from agent: {e}")))
    }

    pub async fn write_file(&self, path: &str, data: &[u8]) -> SandboxResult<()> {
        let data_b64 = base64::engine::general_purpose::STANDARD.encode(data);
        self.call(Request::WriteFile { path, data_b64 }).await.map(|_| ())
    }

    pub async fn list_dir(&self, path: &str) -> SandboxResult<Vec<DirEntryInfo>> {
        let v = self.call(Request::ListDir { path }).await?;
        let r: ListDirResp = serde_json::from_value(v).map_err(|e| SandboxError::AgentUnreachable(e.to_string()))?;
        Ok(r.entries)
    }

    pub async fn make_dir(&self, path: &str) -> SandboxResult<()> {
        self.call(Request::MakeDir { path }).await.map(|_| ())
    }

    pub async fn remove(&self, path: &str) -> SandboxResult<()> {
        self.call(Request::Remove { path }).await.map(|_| ())
    }

    pub async fn exists(&self, path: &str) -> SandboxResult<bool> {
        let v = self.call(Request::Exists { path }).await?;
        let r: ExistsResult = serde_json::from_value(v).map_err(|e| SandboxError::AgentUnreachable(e.to_string()))?;
        Ok(r.exists)
    }

    pub async fn stat(&self, path: &str) -> SandboxResult<StatResp> {
        let v = self.call(Request::Stat { path }).await?;
        serde_json::from_value(v).map_err(|e| SandboxError::AgentUnreachable(e.to_string()))
    }

    pub async fn stats(&self) -> SandboxResult<SandboxStats> {
        let v = self.call(Request::Stats).await?;
        serde_json::from_value(v).map_err(|e| SandboxError::AgentUnreachable(e.to_string()))
    }

    /// Best-effort per spec: callers should treat failure as a warning, not
    /// fatal, both during hibernate and in the Workspace Auto-Saver.
    pub async fn sync_fs(&self, timeout: Duration) -> SandboxResult<()> {
        self.call_timeout(Request::SyncFs, timeout).await.map(|_| ())
    }

    /// Capped at 3s by the caller (kill path); failures are ignored there.
    pub async fn shutdown(&self, timeout: Duration) -> SandboxResult<()> {
        self.call_timeout(Request::Shutdown, timeout).await.map(|_| ())
    }

    pub async fn pty_create(&self, cols: u16, rows: u16, shell: &str) -> SandboxResult<PtySession> {
        let v = self.call(Request::PtyCreate { cols, rows, shell }).await?;
        let r: PtyCreateResult = serde_json::from_value(v).map_err(|e| SandboxError::AgentUnreachable(e.to_string()))?;
        Ok(PtySession { session_id: r.session_id, data_port: r.data_port })
    }

    pub async fn pty_resize(&self, session_id: &str, cols: u16, rows: u16) -> SandboxResult<()> {
        self.call(Request::PtyResize { session_id, cols, rows }).await.map(|_| ())
    }

    pub async fn pty_kill(&self, session_id: &str) -> SandboxResult<()> {
        self.call(Request::PtyKill { session_id }).await.map(|_| ())
    }

    /// Dials a fresh vsock stream to the agent-selected PTY data port, as
    /// required by spec §4.4 ("PTY data uses a separate, freshly-dialed
    /// vsock stream").
    pub async fn dial_pty_data(&self, session: &PtySession) -> SandboxResult<VsockStream> {
        vsock::dial(&self.uds_path, session.data_port).await
    }
}
