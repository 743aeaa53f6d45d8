use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::AppState;
use crate::error::ApiError;
use crate::summary::{ItemsPage, RunSummary, SummaryQuery};
use crate::transport::{open_stream, StreamRequest};

/// Content type of the streaming channel.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Query parameters shared by the run routes.
#[derive(Debug, Default, Deserialize)]
pub struct RunParams {
    /// Analysis alias, if the client knows it.
    pub proofreading_id: Option<String>,
}

/// Query parameters of the items route. Kept as strings so bad values clamp
/// instead of being rejected.
#[derive(Debug, Default, Deserialize)]
pub struct ItemsParams {
    pub cursor: Option<String>,
    pub limit: Option<String>,
    pub proofreading_id: Option<String>,
}

fn summary_query(
    project_id: String,
    run_id: String,
    proofreading_id: Option<String>,
) -> Result<SummaryQuery, ApiError> {
    if project_id.trim().is_empty() || run_id.trim().is_empty() {
        return Err(ApiError::BadRequest {
            message: "projectId and runId are required".to_string(),
        });
    }

    let query = SummaryQuery::new(project_id).with_run_id(run_id);
    Ok(match proofreading_id {
        Some(alias) if !alias.trim().is_empty() => query.with_proofreading_id(alias),
        _ => query,
    })
}

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /projects/:project_id/runs/:run_id/stream`
///
/// Always answers 200; an unknown run is reported inside the stream.
pub async fn stream_run(
    State(state): State<AppState>,
    Path((project_id, run_id)): Path<(String, String)>,
    Query(params): Query<RunParams>,
) -> Response {
    let mut request = StreamRequest::new(project_id, run_id);
    if let Some(alias) = params.proofreading_id {
        request = request.with_proofreading_id(alias);
    }

    let rx = open_stream(state.streams.clone(), request);
    let lines = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|line| (Ok::<_, Infallible>(line), rx))
    });

    (
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(lines),
    )
        .into_response()
}

/// `GET /projects/:project_id/runs/:run_id/summary`
pub async fn get_summary(
    State(state): State<AppState>,
    Path((project_id, run_id)): Path<(String, String)>,
    Query(params): Query<RunParams>,
) -> Result<Json<RunSummary>, ApiError> {
    let query = summary_query(project_id, run_id.clone(), params.proofreading_id)?;
    state
        .summaries
        .get_run_summary(&query)
        .await
        .map(Json)
        .ok_or(ApiError::RunNotFound { run_id })
}

/// `GET /projects/:project_id/runs/:run_id/items`
pub async fn get_items(
    State(state): State<AppState>,
    Path((project_id, run_id)): Path<(String, String)>,
    Query(params): Query<ItemsParams>,
) -> Result<Json<ItemsPage>, ApiError> {
    let query = summary_query(project_id, run_id.clone(), params.proofreading_id)?;
    let page = state
        .summaries
        .get_items_slice(&query, params.cursor.as_deref(), params.limit.as_deref())
        .await
        .ok_or(ApiError::RunNotFound { run_id })?;

    debug!(
        run_id = %page.run_id,
        cursor = %page.cursor,
        returned = page.events.len(),
        total = page.total,
        "Served items page"
    );
    Ok(Json(page))
}

/// Fallback for unknown routes.
pub async fn not_found(uri: OriginalUri) -> ApiError {
    ApiError::NotFound {
        message: format!("not found: {}", uri.0.path()),
    }
}
