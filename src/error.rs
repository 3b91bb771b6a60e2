//! Typed errors and HTTP mapping.

use crate::change::Sequence;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid index name: '{0}'")]
    InvalidName(String),
    #[error("duplicate index name in config: {0}")]
    DuplicateName(String),
    #[error("config load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
}

/// Raised by a reducer when a change cannot be folded. Freezes only the index that raised it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReducerError {
    #[error("change carries no record")]
    MissingRecord,
    #[error("record has no field '{0}'")]
    MissingField(String),
    #[error("field '{field}' is not usable as {expected}")]
    InvalidField { field: String, expected: &'static str },
    #[error("accumulator must be {0}")]
    InvalidAccumulator(&'static str),
    #[error("reducer panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Custom(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    /// Transient; the resilient subscription retries it with backoff.
    #[error("feed disconnected: {0}")]
    Disconnected(String),
    #[error("sequence gap on '{resource_type}': expected {expected}, received {found}")]
    Gap {
        resource_type: String,
        expected: Sequence,
        found: Sequence,
    },
    #[error("feed retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("invalid change: {0}")]
    InvalidChange(String),
    #[error("feed closed")]
    Closed,
    #[error("feed backend: {0}")]
    Backend(String),
}

impl FeedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::Disconnected(_))
    }
}

/// Inbound queue overflow under the drop-and-flag policy. Logged and recorded as a gap on the index.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("inbound queue for index is full; dropped sequences {from}..={to}")]
pub struct QueueOverflowError {
    pub from: Sequence,
    pub to: Sequence,
}

/// Why an index worker entered the Failed state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailureReason {
    #[error("reducer failed at sequence {sequence}: {source}")]
    Reducer {
        sequence: Sequence,
        #[source]
        source: ReducerError,
    },
    #[error("catch-up did not finish within {0:?}")]
    CatchUpTimeout(Duration),
    #[error(transparent)]
    Feed(#[from] FeedError),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("index already registered: {0}")]
    DuplicateIndex(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::Config(_) => (StatusCode::UNPROCESSABLE_ENTITY, "config_error"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::DuplicateIndex(_) => (StatusCode::CONFLICT, "duplicate_index"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Feed(_) => (StatusCode::BAD_GATEWAY, "feed_error"),
            AppError::Db(e) => {
                if let sqlx::Error::RowNotFound = e {
                    (StatusCode::NOT_FOUND, "not_found")
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, "database_error")
                }
            }
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}
