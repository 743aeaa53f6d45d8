use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use super::handlers::{get_items, get_summary, health, not_found, stream_run};
use super::AppState;
use crate::error::{ApiErrorDetail, ApiErrorResponse};

/// Build the HTTP router.
///
/// The request timeout, when configured, covers the request/response routes
/// only; streams stay open for the lifetime of the run.
pub fn router(state: AppState) -> Router {
    let request_timeout = state.config.server.request_timeout;

    let rest = Router::new()
        .route("/projects/:project_id/runs/:run_id/summary", get(get_summary))
        .route("/projects/:project_id/runs/:run_id/items", get(get_items));

    let rest = match request_timeout {
        Some(timeout) => rest.layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .layer(TimeoutLayer::new(timeout)),
        ),
        None => rest,
    };

    Router::new()
        .route("/health", get(health))
        .route("/projects/:project_id/runs/:run_id/stream", get(stream_run))
        .merge(rest)
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_timeout_error(_err: tower::BoxError) -> (StatusCode, axum::Json<ApiErrorResponse>) {
    let response = ApiErrorResponse {
        error: ApiErrorDetail {
            error_code: "SERVICE_UNAVAILABLE".to_string(),
            message: "Request timed out".to_string(),
        },
    };
    (StatusCode::SERVICE_UNAVAILABLE, axum::Json(response))
}
