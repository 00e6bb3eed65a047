//! Control-plane RPC surface (spec §6): one axum handler per row of the
//! external-interface table. Error mapping follows the teacher's own
//! `fn int<E: Display>(e: E) -> (StatusCode, String)` idiom from
//! `features/vm/spawn.rs`, generalized to the full error taxonomy.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use sandbox_types::{
    CreateSandboxReq, ExecCommandReq, FilePathReq, HibernateResp, ListDirResp, ListSandboxesResp, SandboxError,
    SandboxHandle, SandboxResult, SandboxStats, SaveAsTemplateReq, WakeReq, WriteFileReq,
};
use serde::Serialize;
use serde_json::json;

use crate::features::vms::manager::VmManager;
use crate::state::AppState;

const DEFAULT_HIBERNATE_TIMEOUT: Duration = Duration::from_secs(600);

pub fn router() -> Router {
    Router::new()
        .route("/sandboxes", post(create_sandbox).get(list_sandboxes))
        .route("/sandboxes/:id", get(get_sandbox).delete(destroy_sandbox))
        .route("/sandboxes/:id/exec", post(exec_command))
        .route("/sandboxes/:id/read-file", post(read_file))
        .route("/sandboxes/:id/write-file", post(write_file))
        .route("/sandboxes/:id/list-dir", post(list_dir))
        .route("/sandboxes/:id/hibernate", post(hibernate_sandbox))
        .route("/sandboxes/:id/wake", post(wake_sandbox))
        .route("/sandboxes/:id/tap-available", get(is_tap_available))
        .route("/sandboxes/:id/save-as-template", post(save_as_template))
        .route("/sandboxes/:id/stats", get(get_sandbox_stats))
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

fn err_response(e: SandboxError) -> (StatusCode, Json<ErrorBody>) {
    let status = match &e {
        SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
        SandboxError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        SandboxError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        SandboxError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
        SandboxError::HypervisorFailure { .. } => StatusCode::BAD_GATEWAY,
        SandboxError::AgentUnreachable(_) => StatusCode::GATEWAY_TIMEOUT,
        SandboxError::ArchiveFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SandboxError::ObjectStoreFailure(_) => StatusCode::BAD_GATEWAY,
        SandboxError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        SandboxError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        SandboxError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorBody { kind: e.kind(), error: e.to_string() }))
}

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorBody>)>;

fn registration_timeout(handle: &SandboxHandle) -> Duration {
    (handle.end_at - handle.started_at).to_std().unwrap_or(Duration::from_secs(600))
}

async fn create_sandbox(Extension(state): Extension<AppState>, Json(req): Json<CreateSandboxReq>) -> ApiResult<Json<SandboxHandle>> {
    let handle = state.manager.create(req).await.map_err(err_response)?;
    state.router.register(&handle.id, registration_timeout(&handle)).await;
    Ok(Json(handle))
}

async fn destroy_sandbox(Extension(state): Extension<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.router.unregister(&id).await;
    state.manager.kill(&id).await.map_err(err_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_sandbox(Extension(state): Extension<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let instance = state.manager.get(&id).await.map_err(err_response)?;
    Ok(Json(instance.summary().await))
}

async fn list_sandboxes(Extension(state): Extension<AppState>) -> Json<ListSandboxesResp> {
    Json(ListSandboxesResp { items: state.manager.list().await })
}

async fn exec_command(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecCommandReq>,
) -> ApiResult<impl IntoResponse> {
    let result: SandboxResult<_> = state
        .router
        .route(&id, "exec", move |manager: Arc<VmManager>| {
            let id = id.clone();
            async move {
                let agent = manager.agent(&id).await?;
                agent.exec(&req.cmd, &req.args, &req.env, req.cwd.as_deref(), req.timeout_seconds).await
            }
        })
        .await;
    Ok(Json(result.map_err(err_response)?))
}

async fn read_file(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FilePathReq>,
) -> ApiResult<impl IntoResponse> {
    let result: SandboxResult<_> = state
        .router
        .route(&id, "read-file", move |manager: Arc<VmManager>| {
            let id = id.clone();
            async move {
                let agent = manager.agent(&id).await?;
                agent.read_file(&req.path).await
            }
        })
        .await;
    let bytes = result.map_err(err_response)?;
    Ok(Json(json!({ "data_b64": base64::engine::general_purpose::STANDARD.encode(bytes) })))
}

async fn write_file(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(req): Json<WriteFileReq>,
) -> ApiResult<StatusCode> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(&req.data_b64)
        .map_err(|e| err_response(SandboxError::InvalidArgument(format!("bad base64 payload: {e}"))))?;
    state
        .router
        .route(&id, "write-file", move |manager: Arc<VmManager>| {
            let id = id.clone();
            async move {
                let agent = manager.agent(&id).await?;
                agent.write_file(&req.path, &data).await
            }
        })
        .await
        .map_err(err_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_dir(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FilePathReq>,
) -> ApiResult<impl IntoResponse> {
    let result: SandboxResult<_> = state
        .router
        .route(&id, "list-dir", move |manager: Arc<VmManager>| {
            let id = id.clone();
            async move {
                let agent = manager.agent(&id).await?;
                let entries = agent.list_dir(&req.path).await?;
                Ok(ListDirResp { entries })
            }
        })
        .await;
    Ok(Json(result.map_err(err_response)?))
}

async fn hibernate_sandbox(Extension(state): Extension<AppState>, Path(id): Path<String>) -> ApiResult<Json<HibernateResp>> {
    let resp = state.manager.hibernate(&id).await.map_err(err_response)?;
    state.router.mark_hibernated(&id, DEFAULT_HIBERNATE_TIMEOUT).await;
    Ok(Json(resp))
}

async fn wake_sandbox(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(req): Json<WakeReq>,
) -> ApiResult<Json<SandboxHandle>> {
    let handle = state.manager.wake(&id, req).await.map_err(err_response)?;
    state.router.register(&id, registration_timeout(&handle)).await;
    Ok(Json(handle))
}

async fn is_tap_available(Extension(state): Extension<AppState>, Path(id): Path<String>) -> Json<serde_json::Value> {
    Json(json!({ "available": state.manager.is_tap_available(&id) }))
}

async fn save_as_template(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SaveAsTemplateReq>,
) -> ApiResult<StatusCode> {
    let template_id = req.template_id.clone();
    state
        .manager
        .save_as_template(&id, req, move |result| {
            if let Err(e) = result {
                tracing::error!(%template_id, error = %e, "save-as-template upload failed");
            }
        })
        .await
        .map_err(err_response)?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_sandbox_stats(Extension(state): Extension<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let result: SandboxResult<SandboxStats> = state
        .router
        .route(&id, "stats", move |manager: Arc<VmManager>| {
            let id = id.clone();
            async move { manager.agent(&id).await?.stats().await }
        })
        .await;
    Ok(Json(result.map_err(err_response)?))
}
