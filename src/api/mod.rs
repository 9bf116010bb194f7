//! REST API.
//!
//! Every route except `/health` needs an `X-Actor-Id` header naming the local
//! user on whose behalf the request is made. Authorization itself happens in
//! the services.

mod registry;
mod reports;

use crate::error::AppError;
use crate::services::ReportEngine;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

/// Header carrying the acting local user id.
pub const ACTOR_HEADER: &str = "x-actor-id";

/// Shared state for API routes.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReportEngine>,
}

/// Local user id of the caller, set by [`actor_middleware`].
#[derive(Debug, Clone, Copy)]
pub struct Actor(pub i64);

// ── Error handling ───────────────────────────────────────────────────────────

/// JSON error body.
#[derive(Serialize)]
struct ApiError {
    code: &'static str,
    message: String,
    retryable: bool,
    error: AppError,
}

/// Wrapper to make AppError usable as an axum error response.
pub struct ApiErr(AppError);

pub fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::Validation { .. } => StatusCode::BAD_REQUEST,
        AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
        AppError::NotFound { .. } => StatusCode::NOT_FOUND,
        AppError::TrackerAuth { .. } | AppError::TrackerApi { .. } => StatusCode::BAD_GATEWAY,
        AppError::TrackerUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Database { .. } | AppError::Internal { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            log::error!("Request failed: {}", self.0);
        }

        (
            status,
            Json(ApiError {
                code: self.0.code(),
                message: self.0.to_string(),
                retryable: self.0.is_transient(),
                error: self.0,
            }),
        )
            .into_response()
    }
}

impl From<AppError> for ApiErr {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

// ── Actor ────────────────────────────────────────────────────────────────────

/// Reject requests without a usable `X-Actor-Id`, else attach [`Actor`].
pub async fn actor_middleware(mut request: Request<Body>, next: Next) -> Response {
    let actor = request
        .headers()
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok());

    match actor {
        Some(id) => {
            request.extensions_mut().insert(Actor(id));
            next.run(request).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "code": "UNAUTHORIZED",
                "message": "Missing or invalid X-Actor-Id header",
                "retryable": false,
            })),
        )
            .into_response(),
    }
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the full API router.
pub fn router(state: AppState) -> Router {
    let api = reports::report_routes()
        .merge(registry::registry_routes())
        .with_state(state)
        .layer(middleware::from_fn(actor_middleware));

    Router::new().route("/health", get(health)).merge(api)
}

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
