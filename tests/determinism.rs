//! Property tests: replay determinism and catch-up/tail equivalence.

mod common;

use common::*;
use materialize_sdk::config::DeletePolicy;
use materialize_sdk::reducer::{CountBy, CountReducer, SumBy};
use materialize_sdk::{Accumulator, Change, ChangeSink, IndexDefinition, InMemoryChangeFeed};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Debug)]
enum Op {
    Create { id: u64, author: u8, likes: u8 },
    Update { id: u64, author: u8, likes: u8 },
    Delete { id: u64 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..8u64, 0..3u8, 0..50u8).prop_map(|(id, author, likes)| Op::Create { id, author, likes }),
        2 => (0..8u64, 0..3u8, 0..50u8).prop_map(|(id, author, likes)| Op::Update { id, author, likes }),
        1 => (0..8u64).prop_map(|id| Op::Delete { id }),
    ]
}

fn record(id: u64, author: u8, likes: u8) -> Value {
    json!({ "id": id, "author": format!("author-{}", author), "likes": likes })
}

/// Emit `ops` through the bridge, turning each into a valid change for the current record set.
async fn emit_all(feed: &InMemoryChangeFeed, live: &mut HashMap<u64, Value>, ops: &[Op]) {
    for op in ops {
        match op {
            Op::Create { id, author, likes } | Op::Update { id, author, likes } => {
                let after = record(*id, *author, *likes);
                match live.insert(*id, after.clone()) {
                    Some(before) => feed.record_updated("tweets", before, after).await.unwrap(),
                    None => feed.record_created("tweets", after).await.unwrap(),
                };
            }
            Op::Delete { id } => {
                if let Some(before) = live.remove(id) {
                    feed.record_deleted("tweets", before).await.unwrap();
                }
            }
        }
    }
}

fn definitions() -> Vec<IndexDefinition> {
    vec![
        IndexDefinition::new("ByAuthor", "tweets", Arc::new(CountBy::new("author"))),
        IndexDefinition::new("Likes", "tweets", Arc::new(SumBy::new("likes", Some("author".into())))),
        IndexDefinition::new("Created", "tweets", Arc::new(CountReducer)).with_delete_policy(DeletePolicy::Skip),
    ]
}

fn one_pass(def: &IndexDefinition, log: &[Change]) -> Accumulator {
    let mut acc = Accumulator::new(def.initial_value.clone());
    for change in log {
        acc.apply(def, change).unwrap();
    }
    acc
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn independent_engines_agree(ops in prop::collection::vec(op(), 0..40)) {
        let (left, right) = runtime().block_on(async {
            let feed = InMemoryChangeFeed::new();
            let engines = [registry(Arc::new(feed.clone())), registry(Arc::new(feed.clone()))];
            for reg in &engines {
                for def in definitions() {
                    reg.register(def).unwrap();
                }
            }
            emit_all(&feed, &mut HashMap::new(), &ops).await;

            let head = feed.head("tweets");
            let mut results = Vec::new();
            for reg in &engines {
                let mut snapshots = Vec::new();
                for def in definitions() {
                    snapshots.push(wait_live_at(reg, &def.name, head).await);
                }
                reg.shutdown().await;
                results.push(snapshots);
            }
            let right = results.pop().unwrap();
            let left = results.pop().unwrap();
            (left, right)
        });

        for (a, b) in left.iter().zip(&right) {
            prop_assert_eq!(&a.name, &b.name);
            prop_assert_ne!(a.instance_id, b.instance_id);
            prop_assert_eq!(a.value.as_ref(), b.value.as_ref());
            prop_assert_eq!(a.sequence, b.sequence);
        }
    }

    #[test]
    fn catch_up_then_tail_matches_one_pass(
        history in prop::collection::vec(op(), 0..30),
        live_ops in prop::collection::vec(op(), 0..30),
    ) {
        let (log, snapshots) = runtime().block_on(async {
            let feed = InMemoryChangeFeed::new();
            let mut live = HashMap::new();
            emit_all(&feed, &mut live, &history).await;

            let reg = registry(Arc::new(feed.clone()));
            for def in definitions() {
                reg.register(def).unwrap();
            }
            emit_all(&feed, &mut live, &live_ops).await;

            let head = feed.head("tweets");
            let mut snapshots = Vec::new();
            for def in definitions() {
                snapshots.push(wait_live_at(&reg, &def.name, head).await);
            }
            reg.shutdown().await;
            (feed.changes("tweets"), snapshots)
        });

        for (def, snapshot) in definitions().iter().zip(snapshots) {
            let expected = one_pass(def, &log);
            prop_assert_eq!(snapshot.value.as_ref(), expected.value().as_ref());
            prop_assert_eq!(snapshot.sequence, expected.sequence());
            prop_assert!(!snapshot.partial);
        }
    }
}
