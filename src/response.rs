//! Response envelope: `{ data, meta }` for single items, `{ data: [..], meta: {..} }` for listings.

use crate::materialized::{IndexSnapshot, IndexStatus};
use axum::{http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct SuccessOne<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct SuccessMany<T, M> {
    pub data: Vec<T>,
    pub meta: M,
}

/// Listing summary so a dashboard can spot trouble without scanning every index.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct IndexListMeta {
    pub count: u64,
    pub live: u64,
    pub failed: u64,
    pub partial: u64,
}

fn one<T: Serialize>(status: StatusCode, data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    (status, Json(SuccessOne { data, meta: None }))
}

pub fn success_one<T: Serialize>(data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    one(StatusCode::CREATED, data)
}

pub fn success_one_ok<T: Serialize>(data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    one(StatusCode::OK, data)
}

/// Operator commands are applied asynchronously by the index worker.
pub fn success_one_accepted<T: Serialize>(data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    one(StatusCode::ACCEPTED, data)
}

pub fn success_many(
    snapshots: Vec<Arc<IndexSnapshot>>,
) -> (StatusCode, Json<SuccessMany<Arc<IndexSnapshot>, IndexListMeta>>) {
    let meta = snapshots.iter().fold(IndexListMeta::default(), |mut meta, s| {
        meta.count += 1;
        match s.status {
            IndexStatus::Live => meta.live += 1,
            IndexStatus::Failed => meta.failed += 1,
            _ => {}
        }
        if s.partial {
            meta.partial += 1;
        }
        meta
    });
    (StatusCode::OK, Json(SuccessMany { data: snapshots, meta }))
}
