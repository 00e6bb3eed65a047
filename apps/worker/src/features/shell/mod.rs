//! Interactive PTY bridge: proxies a WebSocket to the guest agent's PTY
//! data port over vsock. The split-socket relay loop is the teacher's own
//! console-proxy pattern (`features/vm/shell.rs`), adapted from a raw
//! `UnixStream` to a freshly-dialed `VsockStream` per spec §4.4.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::core::agent_client::{AgentClient, PtySession};
use crate::state::AppState;

pub fn router() -> Router {
    Router::new().route("/sandboxes/:id/shell/ws", get(ws_shell_proxy))
}

#[derive(Deserialize)]
struct ShellQuery {
    #[serde(default = "default_cols")]
    cols: u16,
    #[serde(default = "default_rows")]
    rows: u16,
    #[serde(default = "default_shell")]
    shell: String,
}

fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}

async fn ws_shell_proxy(
    ws: WebSocketUpgrade,
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ShellQuery>,
) -> Response {
    match state.manager.agent(&id).await {
        Ok(agent) => ws.on_upgrade(move |socket| async move {
            if let Err(e) = run_shell(agent, socket, q).await {
                tracing::warn!(sandbox_id = %id, error = ?e, "pty websocket bridge failed");
            }
        }),
        Err(e) => {
            tracing::warn!(sandbox_id = %id, error = %e, "pty bridge rejected: agent unavailable");
            axum::response::IntoResponse::into_response((StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

async fn run_shell(agent: Arc<AgentClient>, ws: WebSocket, q: ShellQuery) -> Result<(), (StatusCode, String)> {
    let session: PtySession = agent
        .pty_create(q.cols, q.rows, &q.shell)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;

    let data_stream = agent
        .dial_pty_data(&session)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
    let (mut read_sock, mut write_sock) = tokio::io::split(data_stream);

    let (ws_tx, mut ws_rx) = ws.split();
    let ws_tx = Arc::new(Mutex::new(ws_tx));

    let ws_tx_clone = ws_tx.clone();
    let ws_to_pty = async {
        while let Some(msg) = ws_rx.next().await {
            let msg = msg.map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
            match msg {
                Message::Text(text) => {
                    write_sock.write_all(text.as_bytes()).await.map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
                }
                Message::Binary(data) => {
                    write_sock.write_all(&data).await.map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
                }
                Message::Ping(payload) => {
                    ws_tx_clone
                        .lock()
                        .await
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
                }
                Message::Pong(_) => {}
                Message::Close(_) => break,
            }
        }
        Ok::<_, (StatusCode, String)>(())
    };

    let ws_tx_clone = ws_tx.clone();
    let pty_to_ws = async {
        let mut buf = [0u8; 4096];
        loop {
            let n = read_sock.read(&mut buf).await.map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
            if n == 0 {
                let _ = ws_tx_clone.lock().await.send(Message::Close(None)).await;
                break;
            }
            ws_tx_clone
                .lock()
                .await
                .send(Message::Binary(buf[..n].to_vec()))
                .await
                .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
        }
        Ok::<_, (StatusCode, String)>(())
    };

    let result = tokio::select! {
        res = ws_to_pty => res,
        res = pty_to_ws => res,
    };

    let _ = agent.pty_kill(&session.session_id).await;
    result
}
