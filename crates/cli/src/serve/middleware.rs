//! Shared-secret authentication.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::state::AppState;

/// Every route except `/health` needs the webhook secret, either as
/// `Authorization: Bearer <secret>` or as `x-webhook-secret: <secret>`.
pub(crate) async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let headers = request.headers();
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let header_secret = headers
        .get("x-webhook-secret")
        .and_then(|v| v.to_str().ok());

    let presented = match bearer.or(header_secret) {
        Some(secret) => secret,
        None => {
            return super::json_error(StatusCode::UNAUTHORIZED, "authentication required")
                .into_response()
        }
    };

    if presented != state.webhook_secret {
        tracing::warn!(path = %request.uri().path(), "rejected request with wrong webhook secret");
        return super::json_error(StatusCode::UNAUTHORIZED, "invalid webhook secret")
            .into_response();
    }
    next.run(request).await
}
