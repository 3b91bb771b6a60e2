//! Router builders. Mount index routes under `/api/v1` and common routes at the root.

pub mod common;
pub mod index;

pub use common::{common_routes, common_routes_with_ready};
pub use index::index_routes;
