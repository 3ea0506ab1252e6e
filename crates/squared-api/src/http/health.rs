use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::json;

use super::ServerState;

/// Liveness plus a hint when the published catalog lags the index.
pub async fn handler(State(state): State<ServerState>) -> impl IntoResponse {
    let stale = state.catalog.is_stale();
    let status = if stale { "degraded" } else { "ok" };
    Json(json!({
        "status": status,
        "resources": state.catalog.len(),
        "catalog_stale": stale,
    }))
}
