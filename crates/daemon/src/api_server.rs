//! HTTP request boundary
//!
//! Thin axum layer over [`Daemon`]: parse input, call into the core,
//! serialize the result.

use crate::daemon::{Daemon, DaemonError, JobRequest};
use crate::job::SubmissionError;
use crate::persistence::{HistoryEntry, StatsSummary};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Errors that can occur when running the API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Shared handler state
pub type SharedDaemon = Arc<Daemon>;

#[derive(Debug, Deserialize)]
struct StatusQuery {
    job_id: Option<String>,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Handler for POST /jobs
async fn create_job(State(daemon): State<SharedDaemon>, Json(request): Json<JobRequest>) -> Response {
    match daemon.submit(request).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "message": "Job queued.", "job_id": job_id })),
        )
            .into_response(),
        Err(DaemonError::Submission(SubmissionError::StorageNotConfigured)) => error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            SubmissionError::StorageNotConfigured.to_string(),
        ),
        Err(DaemonError::Submission(e)) => error_body(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => {
            error!("Submission failed: {}", e);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Handler for GET /status?job_id=...
async fn get_status(State(daemon): State<SharedDaemon>, Query(query): Query<StatusQuery>) -> Response {
    let Some(job_id) = query.job_id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Job ID missing.", "running": false, "state": "error" })),
        )
            .into_response();
    };

    match daemon.status(&job_id) {
        Some(view) => Json(view).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Job not found or already cleaned up.",
                "running": false,
                "state": "not_found"
            })),
        )
            .into_response(),
    }
}

/// Handler for GET /history
async fn get_history(State(daemon): State<SharedDaemon>) -> Json<Vec<HistoryEntry>> {
    Json(daemon.history().await)
}

/// Handler for POST /history/clear
async fn clear_history(State(daemon): State<SharedDaemon>) -> Response {
    if daemon.clear_history().await {
        Json(json!({ "message": "History cleared (if enabled)." })).into_response()
    } else {
        error_body(StatusCode::INTERNAL_SERVER_ERROR, "Failed to clear history.")
    }
}

/// Handler for GET /stats
async fn get_stats(State(daemon): State<SharedDaemon>) -> Json<StatsSummary> {
    Json(daemon.stats().await)
}

/// Creates the axum Router with all endpoints
pub fn create_router(daemon: SharedDaemon) -> Router {
    Router::new()
        .route("/jobs", post(create_job))
        .route("/status", get(get_status))
        .route("/history", get(get_history))
        .route("/history/clear", post(clear_history))
        .route("/stats", get(get_stats))
        .with_state(daemon)
}

/// Serve the API on the configured bind address until `shutdown` is cancelled.
pub async fn run_api_server(
    daemon: SharedDaemon,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let bind = daemon.config().server.bind.clone();
    let app = create_router(daemon);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("API listening on {}", bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
