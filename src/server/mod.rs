//! HTTP front end over a [`SessionManager`].

use crate::config::SandboxConfig;
use crate::error::{ErrorBody, ExecError};
use crate::manager::SessionManager;
use crate::request::{ExecuteBody, ExecutionRequest};
use crate::session::cancel::CancelHandle;
use crate::session::SessionId;
use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// An [`ExecError`] rendered as `{kind, message}` with a matching status.
pub struct ApiError(pub ExecError);

impl From<ExecError> for ApiError {
    fn from(err: ExecError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody::from(&self.0));
        match &self.0 {
            err if err.is_caller_error() => (StatusCode::BAD_REQUEST, body).into_response(),
            ExecError::Overloaded { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, "1")],
                body,
            )
                .into_response(),
            // Non-standard "client closed request"
            ExecError::Cancelled => (
                StatusCode::from_u16(499).unwrap_or(StatusCode::CONFLICT),
                body,
            )
                .into_response(),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, body).into_response(),
        }
    }
}

#[derive(Serialize)]
struct LanguageEntry {
    language: String,
    image: String,
}

/// Largest `/execute` body the configured source and input caps allow:
/// worst-case JSON escaping of the source, base64 of the input, and slack
/// for the envelope.
pub fn request_body_limit(config: &SandboxConfig) -> usize {
    let source = config.max_source_bytes.saturating_mul(6);
    let input = config.max_input_bytes.div_ceil(3).saturating_mul(4);
    source
        .saturating_add(input)
        .saturating_add(REQUEST_ENVELOPE_BYTES)
}

const REQUEST_ENVELOPE_BYTES: usize = 64 * 1024;

pub fn router(manager: SessionManager) -> Router {
    let body_limit = request_body_limit(manager.config());
    Router::new()
        .route("/execute", post(execute))
        .route("/health", get(health))
        .route("/languages", get(languages))
        .route("/sessions", get(sessions))
        .route("/sessions/:id", delete(cancel_session))
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, manager: SessionManager, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    info!(%addr, "codecell server listening");

    axum::Server::from_tcp(listener)?
        .serve(router(manager).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))
}

async fn execute(
    State(manager): State<SessionManager>,
    body: Result<Json<ExecuteBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) =
        body.map_err(|e| ExecError::InvalidRequest(format!("malformed request body: {}", e)))?;
    let request = ExecutionRequest::try_from(body)?;
    // Dropping this future (client went away) reclaims the session.
    let result = manager
        .execute_with_cancel(request, CancelHandle::new())
        .await?;
    Ok(Json(result).into_response())
}

async fn health(State(manager): State<SessionManager>) -> impl IntoResponse {
    let report = manager.health().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn languages(State(manager): State<SessionManager>) -> impl IntoResponse {
    let entries: Vec<LanguageEntry> = manager
        .registry()
        .languages()
        .map(|(language, image)| LanguageEntry {
            language: language.to_string(),
            image: image.reference.clone(),
        })
        .collect();
    Json(entries)
}

async fn sessions(State(manager): State<SessionManager>) -> impl IntoResponse {
    Json(manager.live_sessions())
}

async fn cancel_session(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id: SessionId = id
        .parse()
        .map_err(|_| ExecError::InvalidRequest(format!("'{}' is not a session id", id)))?;
    if manager.cancel(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

async fn metrics(State(manager): State<SessionManager>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        manager.metrics().encode(),
    )
}
