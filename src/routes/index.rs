//! Index routes: list, register, read, unregister, watch, pause, resume.

use crate::handlers::index::{
    get_index, list_indexes, pause_index, register_index, resume_index, unregister_index, watch_index,
};
use crate::state::AppState;
use axum::{routing::get, routing::post, Router};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

/// Index definitions are small; anything larger is rejected before parsing.
const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn index_routes(state: AppState) -> Router {
    Router::new()
        .route("/indexes", get(list_indexes).post(register_index))
        .route("/indexes/:name", get(get_index).delete(unregister_index))
        .route("/indexes/:name/watch", get(watch_index))
        .route("/indexes/:name/pause", post(pause_index))
        .route("/indexes/:name/resume", post(resume_index))
        .layer(ServiceBuilder::new().layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)))
        .with_state(state)
}
