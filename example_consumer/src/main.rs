//! Example consumer: a separate Rust project that uses materialize-sdk as a dependency.
//!
//! Runs entirely in memory. `POST /tweets` plays the storage bridge and emits a change; the
//! AuthorCounts and TweetTotal indexes follow along under `/api/v1/indexes`.
//!
//! Run from repo root: `cargo run -p example-consumer`
//! Or from this directory: `cargo run`

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use materialize_sdk::{
    common_routes_with_ready, index_routes, AppState, ChangeSink, EngineConfig, IndexConfig, IndexRegistry,
    InMemoryChangeFeed,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("materialize_sdk=info")),
        )
        .init();

    let feed = InMemoryChangeFeed::new();
    for (id, author) in [(1, "ada"), (2, "grace"), (3, "ada")] {
        feed.record_created("tweets", json!({ "id": id, "author": author, "text": "hello" }))
            .await?;
    }

    let registry = IndexRegistry::init(Arc::new(feed.clone()), EngineConfig::from_env()?);
    let indexes: Vec<IndexConfig> = serde_json::from_value(json!([
        { "name": "AuthorCounts", "sourceResourceType": "tweets", "reducer": { "kind": "count_by", "field": "author" } },
        { "name": "TweetTotal", "sourceResourceType": "tweets", "reducer": { "kind": "count" } }
    ]))?;
    materialize_sdk::validate(&indexes)?;
    for index in &indexes {
        registry.register_config(index)?;
    }

    let state = AppState::new(registry.clone());
    let tweets = Router::new().route("/tweets", post(create_tweet)).with_state(feed);
    let app = Router::new()
        .merge(common_routes_with_ready(state.clone()))
        .merge(tweets)
        .nest("/api/v1", index_routes(state));

    let listener = TcpListener::bind("127.0.0.1:3000").await?;
    let port = listener.local_addr()?.port();
    tracing::info!("Example consumer listening on http://127.0.0.1:{}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    registry.shutdown().await;
    Ok(())
}

async fn create_tweet(
    State(feed): State<InMemoryChangeFeed>,
    Json(tweet): Json<Value>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    match feed.record_created("tweets", tweet).await {
        Ok(change) => Ok((StatusCode::CREATED, Json(json!({ "sequence": change.sequence })))),
        Err(e) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": { "code": "invalid_change", "message": e.to_string() } })),
        )),
    }
}
