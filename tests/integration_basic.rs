//! End-to-end scenario: a single manager over two tiers (fast tier over a
//! slower authoritative one). Mirrors the "single-manager two-tier" and
//! "`Add` is idempotent-false" properties from the core's testable
//! properties list.

mod common;

use common::{item, MemTier};
use std::sync::Arc;
use tiered_cache_core::ManagerBuilder;

#[tokio::test]
async fn put_then_get_hits_top_tier_without_touching_distributed() {
    let top = Arc::new(MemTier::new("top"));
    let distributed = Arc::new(MemTier::new("distributed").as_source());
    let manager = ManagerBuilder::new()
        .with_tier(top.clone())
        .with_tier(distributed.clone())
        .build()
        .await
        .unwrap();

    manager.put(item("a", b"1")).await.unwrap();
    let got = manager.get("a", None).await.unwrap();
    assert_eq!(got.unwrap().value(), Some(&b"1"[..]));

    let top_stats = top.stats_snapshot();
    assert_eq!(top_stats.hits, 1);
    assert_eq!(top_stats.misses, 0);
    // The top tier already had the value from the write-through put; the
    // distributed tier is never consulted once a closer tier hits.
    let distributed_stats = distributed.stats_snapshot();
    assert_eq!(distributed_stats.hits, 0);
}

#[tokio::test]
async fn add_is_idempotent_false_on_conflict_and_keeps_first_value() {
    let top = Arc::new(MemTier::new("top"));
    let distributed = Arc::new(MemTier::new("distributed").as_source());
    let manager = ManagerBuilder::new()
        .with_tier(top)
        .with_tier(distributed)
        .build()
        .await
        .unwrap();

    assert!(manager.add(item("k", b"v1")).await.unwrap());
    assert!(!manager.add(item("k", b"v2")).await.unwrap());

    let stored = manager.get("k", None).await.unwrap().unwrap();
    assert_eq!(stored.value(), Some(&b"v1"[..]));
}

#[tokio::test]
async fn empty_region_string_behaves_as_absent_region() {
    let top = Arc::new(MemTier::new("top"));
    let distributed = Arc::new(MemTier::new("distributed").as_source());
    let manager = ManagerBuilder::new()
        .with_tier(top)
        .with_tier(distributed)
        .build()
        .await
        .unwrap();

    manager.put(item("k", b"v")).await.unwrap();
    let via_empty_region = manager.get("k", Some("")).await.unwrap();
    assert_eq!(via_empty_region.unwrap().value(), Some(&b"v"[..]));
}
