//! HTTP handlers for index queries and operator controls.

pub mod index;
pub use index::*;
