//! HTTP surface: router assembly, shared state, and error mapping.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gsc_common::{Config, OpError};
use serde_json::json;
use tracing::warn;

use crate::console;
use crate::files;
use crate::process::ProcessBridge;

const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Shared state for all handlers.
pub struct AppState {
    pub bridge: Arc<ProcessBridge>,
    pub config: Arc<Config>,
}

/// Wrapper mapping [`OpError`] onto HTTP responses.
///
/// `UnsafePath` and `Io` answer with fixed phrases only; resolved absolute
/// paths and raw OS errors stay in the log.
pub struct HttpError(pub OpError);

impl From<OpError> for HttpError {
    fn from(err: OpError) -> Self {
        Self(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            OpError::Validation(what) => (
                StatusCode::BAD_REQUEST,
                format!("missing or malformed argument: {what}"),
            ),
            OpError::UnsafePath => (StatusCode::FORBIDDEN, "invalid path".to_string()),
            OpError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            OpError::NotRunning => (
                StatusCode::CONFLICT,
                "server process is not running".to_string(),
            ),
            OpError::SpawnFailed(err) => {
                warn!(error = %err, "spawn failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to start server process".to_string(),
                )
            }
            OpError::Io(err) => {
                warn!(error = %err, "file operation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "operation failed".to_string(),
                )
            }
        };
        (status, message).into_response()
    }
}

/// Build the daemon's router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { Redirect::to("/fileexplorer?p=.") }))
        .route("/fileexplorer", get(files::file_explorer))
        .route(
            "/fio",
            get(files::download)
                .post(files::upload)
                .delete(files::delete),
        )
        .route("/fcp", get(files::copy))
        .route("/console", get(console::console_page))
        .route("/console/ws", get(console::console_ws))
        .route("/control/start", post(control_start))
        .route("/control/stop", post(control_stop))
        .route("/control/status", get(control_status))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(Arc::new(state))
}

async fn control_start(State(state): State<Arc<AppState>>) -> Result<Response, HttpError> {
    state.bridge.start().await?;
    Ok(status_body(&state).await.into_response())
}

async fn control_stop(State(state): State<Arc<AppState>>) -> Response {
    state.bridge.stop().await;
    status_body(&state).await.into_response()
}

async fn control_status(State(state): State<Arc<AppState>>) -> Response {
    status_body(&state).await.into_response()
}

async fn status_body(state: &AppState) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.bridge.state().await.as_str(),
        "transcript_bytes": state.bridge.transcript_len(),
    }))
}
