use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use check_common::error::JobsError;
use check_common::jobs::{Jobs, PollResponse, SubmitResponse};
use check_common::types::CheckRequest;

use super::AppState;

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

/// Errors surfaced by the async endpoints, mapped onto the HTTP contract:
/// 429 for admission refusals, 404 for unknown or expired jobs, 503 when the
/// backend is not configured, 500 for everything else.
pub enum ApiError {
    Unavailable,
    NotFound,
    BacklogFull(String),
    Internal(String),
}

impl From<JobsError> for ApiError {
    fn from(error: JobsError) -> Self {
        match error {
            JobsError::BacklogFull { .. } => ApiError::BacklogFull(error.to_string()),
            other => {
                error!("jobs backend error: {}", other);
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "async check API is not enabled on this service".to_owned(),
            ),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                "async job not found or expired".to_owned(),
            ),
            ApiError::BacklogFull(detail) => (StatusCode::TOO_MANY_REQUESTS, detail),
            ApiError::Internal(detail) => (StatusCode::INTERNAL_SERVER_ERROR, detail),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

fn backend(state: &AppState) -> Result<Arc<dyn Jobs>, ApiError> {
    match &state.jobs {
        Some(jobs) => Ok(jobs.clone()),
        None => {
            warn!("async API requested but the jobs backend is not configured");
            Err(ApiError::Unavailable)
        }
    }
}

pub async fn submit(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let jobs = backend(&state)?;
    info!(
        snippets = request.snippets.len(),
        timeout = request.timeout,
        debug = request.debug,
        reuse = request.reuse,
        "async submit received"
    );
    let response = jobs.submit(request).await?;
    info!(
        job_id = %response.job_id,
        total_snippets = response.total_snippets,
        expires_at = %response.expires_at,
        "async submit accepted"
    );
    Ok(Json(response))
}

pub async fn poll(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<PollResponse>, ApiError> {
    let jobs = backend(&state)?;
    match jobs.poll(&job_id).await? {
        Some(poll) => {
            info!(
                job_id = %poll.job_id,
                status = %poll.status,
                done = poll.progress.done,
                failed = poll.progress.failed,
                running = poll.progress.running,
                total = poll.progress.total,
                has_results = poll.results.is_some(),
                "async poll"
            );
            Ok(Json(poll))
        }
        None => Err(ApiError::NotFound),
    }
}
