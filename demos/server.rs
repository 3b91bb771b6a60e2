//! Example server: Postgres change log as the feed, index definitions from INDEX_CONFIG_PATH,
//! common routes at the root and index routes under /api/v1.

use materialize_sdk::{
    common_routes_with_ready, ensure_change_log, index_routes, load_index_configs, AppState, EngineConfig,
    IndexRegistry, PgChangeFeed,
};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("materialize_sdk=info".parse()?))
        .init();

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/materialize".into());
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    ensure_change_log(&pool).await?;

    let engine_config = EngineConfig::from_env()?;
    let registry = IndexRegistry::init(Arc::new(PgChangeFeed::new(pool.clone())), engine_config);

    let config_path = std::env::var("INDEX_CONFIG_PATH").unwrap_or_else(|_| "indexes".into());
    for index in load_index_configs(&config_path).await? {
        registry.register_config(&index)?;
    }

    let state = AppState::new(registry.clone());
    let app = Router::new()
        .merge(common_routes_with_ready(state.clone()))
        .nest("/api/v1", index_routes(state));

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    registry.shutdown().await;
    Ok(())
}
