//! Index query and control handlers.

use crate::config::{validate, IndexConfig};
use crate::engine::ResumePolicy;
use crate::error::AppError;
use crate::materialized::WatchUpdate;
use crate::response::{success_many, success_one, success_one_accepted, success_one_ok};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use std::time::Duration;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub async fn list_indexes(State(state): State<AppState>) -> impl IntoResponse {
    success_many(state.registry.list())
}

pub async fn get_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let snapshot = state.registry.get(&name)?;
    tracing::debug!(index = %name, sequence = snapshot.sequence, status = snapshot.status.as_str(), "read index");
    Ok(success_one_ok(snapshot))
}

/// Register an index from its declarative config. Responds with the initial snapshot.
pub async fn register_index(
    State(state): State<AppState>,
    Json(config): Json<IndexConfig>,
) -> Result<impl IntoResponse, AppError> {
    validate(std::slice::from_ref(&config))?;
    state.registry.register_config(&config)?;
    let snapshot = state.registry.get(&config.name)?;
    Ok(success_one(snapshot))
}

pub async fn unregister_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.registry.unregister(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Server-sent `snapshot` events: the current state first, then one per publish.
pub async fn watch_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let updates = state.registry.watch(&name)?;
    tracing::debug!(index = %name, "watch opened");
    let events = updates.map(|snapshot| {
        Event::default()
            .event("snapshot")
            .id(snapshot.version.to_string())
            .json_data(WatchUpdate::from(snapshot.as_ref()))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

pub async fn pause_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.registry.pause(&name)?;
    Ok(success_one_accepted(state.registry.get(&name)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResumeParams {
    #[serde(default)]
    pub policy: ResumePolicy,
}

pub async fn resume_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<ResumeParams>,
) -> Result<impl IntoResponse, AppError> {
    state.registry.resume(&name, params.policy)?;
    Ok(success_one_accepted(state.registry.get(&name)?))
}
