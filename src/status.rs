// HTTP status surface: a small read-only view of server state, mostly for
// debugging and dashboards. `GET /status` reports the server itself,
// `GET /source` the managed source's parameter map.

use crate::server::SharedStatus;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;
use std::sync::Arc;

/// Build the status router over the control task's shared snapshot.
pub fn router(shared: Arc<SharedStatus>) -> Router {
    Router::new()
        .route("/status", get(serve_status))
        .route("/source", get(serve_source_status))
        .fallback(not_found)
        .with_state(shared)
}

async fn serve_status(State(shared): State<Arc<SharedStatus>>) -> Response {
    Json(shared.server.read().clone()).into_response()
}

async fn serve_source_status(State(shared): State<Arc<SharedStatus>>) -> Response {
    match shared.source.read().clone() {
        Some(status) => Json(Value::Object(status)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
