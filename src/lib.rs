//! Materialize SDK: incremental materialized indexes over an ordered change feed.

pub mod bridge;
pub mod change;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod handlers;
pub mod materialized;
pub mod reducer;
pub mod registry;
pub mod response;
pub mod routes;
pub mod state;
pub mod store;

pub use bridge::ChangeSink;
pub use change::{Change, Operation, Sequence};
pub use config::{load_index_configs, validate, EngineConfig, IndexConfig, ReducerConfig};
pub use engine::{Accumulator, ResumePolicy};
pub use error::{AppError, ConfigError, FailureReason, FeedError, ReducerError};
pub use feed::{CatchUpSource, ChangeFeed, ChangeSubscription, InMemoryChangeFeed, PgChangeFeed, PgChangeSink};
pub use materialized::{IndexSnapshot, IndexStatus, MaterializedStore, SequenceGap, WatchStream, WatchUpdate};
pub use reducer::Reducer;
pub use registry::{IndexDefinition, IndexRegistry};
pub use response::{success_many, success_one};
pub use routes::{common_routes, common_routes_with_ready, index_routes};
pub use state::AppState;
pub use store::{append_change, ensure_change_log};
