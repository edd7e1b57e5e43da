//! RPC server - `DispatcherCore` を HTTP で公開する
//!
//! すべて POST + JSON。共有シークレットは `x-autotask-key` header で照合する。

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::{DispatcherCore, RefreshReport};
use crate::app::ReaperLoop;
use crate::app::status::DispatcherStatus;
use crate::domain::{
    CrashReport, DispatchError, ErrorKind, GetTaskReply, InvalidConfigReport, StoreError,
    SuccessReport, TaskSn,
};
use crate::rpc::wire::{self, AUTH_HEADER, GetTaskRequest};
use crate::store::TaskSubmission;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing or invalid x-autotask-key header")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err.kind() {
            ErrorKind::Permanent => Self::BadRequest(err.to_string()),
            ErrorKind::Transient | ErrorKind::Infrastructure => Self::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (code, self.to_string()).into_response()
    }
}

#[derive(Clone)]
struct ServerState {
    core: Arc<DispatcherCore>,
    auth_key: Option<Arc<str>>,
}

impl ServerState {
    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(expected) = &self.auth_key else {
            return Ok(());
        };
        let presented = headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok());
        if presented == Some(expected.as_ref()) {
            Ok(())
        } else {
            warn!("rejected request with a bad shared secret");
            Err(ApiError::Unauthorized)
        }
    }
}

pub fn router(core: Arc<DispatcherCore>) -> Router {
    let state = ServerState {
        auth_key: core.config().auth_key.as_deref().map(Arc::from),
        core,
    };
    Router::new()
        .route(wire::PING, post(ping))
        .route(wire::GET_TASK, post(get_task))
        .route(wire::TASK_SUCCESS, post(task_success))
        .route(wire::TASK_CRASH, post(task_crash))
        .route(wire::INVALID_CONFIG, post(invalid_config))
        .route(wire::REFRESH, post(refresh))
        .route(wire::STATUS, post(status))
        .route(wire::SHUTDOWN, post(shutdown))
        .route(wire::SUBMIT, post(submit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Raw body: a malformed cluster state is answered with `-99`, not a 4xx.
async fn ping(
    State(s): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<i32>, ApiError> {
    s.authorize(&headers)?;
    Ok(Json(s.core.ping_raw(&body).await))
}

async fn get_task(
    State(s): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<GetTaskRequest>,
) -> Result<Json<GetTaskReply>, ApiError> {
    s.authorize(&headers)?;
    Ok(Json(s.core.get_task(&req.worker_name, req.combine).await))
}

async fn task_success(
    State(s): State<ServerState>,
    headers: HeaderMap,
    Json(report): Json<SuccessReport>,
) -> Result<Json<bool>, ApiError> {
    s.authorize(&headers)?;
    Ok(Json(s.core.task_success(&report).await?))
}

async fn task_crash(
    State(s): State<ServerState>,
    headers: HeaderMap,
    Json(report): Json<CrashReport>,
) -> Result<Json<bool>, ApiError> {
    s.authorize(&headers)?;
    Ok(Json(s.core.task_crash(&report).await?))
}

async fn invalid_config(
    State(s): State<ServerState>,
    headers: HeaderMap,
    Json(report): Json<InvalidConfigReport>,
) -> Result<Json<bool>, ApiError> {
    s.authorize(&headers)?;
    Ok(Json(s.core.invalid_config(&report).await?))
}

async fn refresh(
    State(s): State<ServerState>,
    headers: HeaderMap,
) -> Result<Json<RefreshReport>, ApiError> {
    s.authorize(&headers)?;
    Ok(Json(s.core.refresh_queue().await?))
}

async fn status(
    State(s): State<ServerState>,
    headers: HeaderMap,
) -> Result<Json<DispatcherStatus>, ApiError> {
    s.authorize(&headers)?;
    Ok(Json(s.core.status().await))
}

async fn shutdown(
    State(s): State<ServerState>,
    headers: HeaderMap,
) -> Result<Json<String>, ApiError> {
    s.authorize(&headers)?;
    Ok(Json(s.core.shutdown()))
}

async fn submit(
    State(s): State<ServerState>,
    headers: HeaderMap,
    Json(tasks): Json<Vec<TaskSubmission>>,
) -> Result<Json<Vec<TaskSn>>, ApiError> {
    s.authorize(&headers)?;
    Ok(Json(s.core.submit(&tasks).await?))
}

/// Binds the configured address and serves until `shutdown` resolves.
pub async fn serve<F>(core: Arc<DispatcherCore>, shutdown: F) -> Result<(), DispatchError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = core.config().listen;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| DispatchError::Bind { addr, source })?;
    serve_on(listener, core, shutdown).await
}

pub async fn serve_on<F>(
    listener: TcpListener,
    core: Arc<DispatcherCore>,
    shutdown: F,
) -> Result<(), DispatchError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local = listener.local_addr().map_err(DispatchError::Serve)?;
    info!(name = %core.name(), instance = %core.instance(), %local, "dispatcher listening");
    axum::serve(listener, router(core))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(DispatchError::Serve)
}

/// Serves with a background reaper until a requested shutdown has drained.
///
/// `signal` (e.g. SIGTERM) requests the shutdown; so does the admin RPC.
pub async fn run_dispatcher<S>(
    listener: TcpListener,
    core: Arc<DispatcherCore>,
    signal: S,
) -> Result<(), DispatchError>
where
    S: Future<Output = ()> + Send + 'static,
{
    let reaper = tokio::spawn(ReaperLoop::new(Arc::clone(&core)).run());

    let signalled = Arc::clone(&core);
    let watcher = tokio::spawn(async move {
        signal.await;
        signalled.shutdown();
    });

    let result = serve_on(listener, core, async move {
        if let Err(e) = reaper.await {
            warn!(error = %e, "reaper loop ended abnormally");
        }
    })
    .await;
    watcher.abort();
    info!("dispatcher stopped");
    result
}
