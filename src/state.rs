//! Shared application state for all routes.

use crate::registry::IndexRegistry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<IndexRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<IndexRegistry>) -> Self {
        AppState { registry }
    }
}
