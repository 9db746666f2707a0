//! Route handlers: health, trigger, status, reset.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use leadrun_engine::{DriverError, RunRequest};
use serde::Deserialize;

use super::json_error;
use super::state::AppState;

pub(crate) const TRIGGER_PATH: &str = "/smart-resume-client-by-client";
pub(crate) const STATUS_PATH: &str = "/smart-resume-status";
pub(crate) const RESET_PATH: &str = "/reset-smart-resume-lock";

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

/// POST /smart-resume-client-by-client
///
/// Returns 202 once the lock is held; the run continues in the background.
pub(crate) async fn handle_trigger(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: RunRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(message) => return json_error(StatusCode::BAD_REQUEST, &message).into_response(),
    };

    match state.driver.start(request) {
        Ok(started) => {
            tracing::info!(job_id = %started.job_id, run_id = %started.run_id, stream = started.stream, "smart resume started");
            (StatusCode::ACCEPTED, Json(started)).into_response()
        }
        Err(DriverError::AlreadyRunning {
            job_id,
            age_minutes,
        }) => {
            let body = serde_json::json!({
                "error": "smart resume already running",
                "jobId": job_id,
                "ageMinutes": age_minutes,
            });
            (StatusCode::CONFLICT, Json(body)).into_response()
        }
        Err(e @ (DriverError::Config(_) | DriverError::InvalidRunId(_))) => {
            json_error(StatusCode::BAD_REQUEST, &e.to_string()).into_response()
        }
        Err(e) => route_failure(&state, TRIGGER_PATH, &e).await,
    }
}

/// GET /smart-resume-status
pub(crate) async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.driver.status()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetBody {
    #[serde(default)]
    force_terminate: bool,
}

/// POST /reset-smart-resume-lock
pub(crate) async fn handle_reset(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let reset: ResetBody = match parse_body(&body) {
        Ok(r) => r,
        Err(message) => return json_error(StatusCode::BAD_REQUEST, &message).into_response(),
    };
    let outcome = state.driver.reset(reset.force_terminate);
    (StatusCode::OK, Json(outcome)).into_response()
}

/// Empty bodies mean "all defaults".
fn parse_body<T>(body: &[u8]) -> Result<T, String>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| format!("invalid request body: {}", e))
}

/// Log a server-side failure, record it as a production issue and answer 500.
async fn route_failure(state: &AppState, path: &str, error: &DriverError) -> Response {
    let message = error.to_string();
    tracing::error!(path, error = %message, "route failed");
    if let Err(e) = state
        .driver
        .issues()
        .record_route_error(path, None, &message)
        .await
    {
        tracing::warn!(path, error = %e, "could not record route failure");
    }
    json_error(StatusCode::INTERNAL_SERVER_ERROR, &message).into_response()
}
