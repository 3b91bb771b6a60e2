//! Common routes: health, readiness, version.

use crate::materialized::IndexStatus;
use crate::state::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyBody {
    status: &'static str,
    indexes: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failed: Vec<String>,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

/// Degraded while any index is failed. Catching-up indexes still count as ready.
async fn ready(State(state): State<AppState>) -> Result<Json<ReadyBody>, (axum::http::StatusCode, Json<ReadyBody>)> {
    let snapshots = state.registry.list();
    let failed: Vec<String> = snapshots
        .iter()
        .filter(|s| s.status == IndexStatus::Failed)
        .map(|s| s.name.clone())
        .collect();
    let body = ReadyBody {
        status: if failed.is_empty() { "ok" } else { "degraded" },
        indexes: snapshots.len(),
        failed,
    };
    if !body.failed.is_empty() {
        return Err((axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(body)));
    }
    Ok(Json(body))
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Common routes (no state): GET /health, GET /version, GET /info.
pub fn common_routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/info", get(version))
}

/// Common routes including readiness over index status. Requires AppState.
pub fn common_routes_with_ready(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/version", get(version))
        .route("/info", get(version))
        .with_state(state)
}
