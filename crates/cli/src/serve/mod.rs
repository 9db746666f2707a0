//! `leadrun serve` -- HTTP trigger, status and reset surface for smart resume.
//!
//! Endpoints:
//! - GET  /health                          - Server status (exempt from auth)
//! - POST /smart-resume-client-by-client   - Start a run (202, 409 when busy)
//! - GET  /smart-resume-status             - Advisory lock state
//! - POST /reset-smart-resume-lock         - Clear the lock, optionally cancelling the run
//!
//! All responses use Content-Type: application/json.

mod handlers;
mod middleware;
mod state;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use leadrun_engine::SmartResumeDriver;
use tower_http::trace::TraceLayer;

use self::handlers::{
    handle_health, handle_not_found, handle_reset, handle_status, handle_trigger, RESET_PATH,
    STATUS_PATH, TRIGGER_PATH,
};
use self::middleware::auth_middleware;
use self::state::AppState;

/// Request bodies are a handful of small fields.
const MAX_BODY_SIZE: usize = 64 * 1024;

fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route(TRIGGER_PATH, post(handle_trigger))
        .route(STATUS_PATH, get(handle_status))
        .route(RESET_PATH, post(handle_reset))
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Serve until Ctrl+C.
pub async fn start_server(
    port: u16,
    driver: SmartResumeDriver,
    webhook_secret: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = Arc::new(AppState {
        driver,
        webhook_secret,
    });
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "leadrun listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    tracing::info!("received shutdown signal");
}
