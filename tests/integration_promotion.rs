//! End-to-end scenario: a value discovered only in the bottommost tier is
//! promoted into every tier above it on read, so a subsequent read for the
//! same key hits the topmost tier instead of going all the way down.

mod common;

use common::{item, MemTier};
use std::sync::Arc;
use tiered_cache_core::{CacheTier, ManagerBuilder};

#[tokio::test]
async fn get_promotes_bottommost_hit_into_top_tier() {
    let top = Arc::new(MemTier::new("top"));
    let distributed = Arc::new(MemTier::new("distributed").as_source());
    distributed.put_async(item("b", b"2")).await.unwrap();

    let manager = ManagerBuilder::new()
        .with_tier(top.clone())
        .with_tier(distributed.clone())
        .build()
        .await
        .unwrap();

    assert!(!top.contains("b", None));

    let first = manager.get("b", None).await.unwrap();
    assert_eq!(first.unwrap().value(), Some(&b"2"[..]));
    assert!(top.contains("b", None), "promotion must populate the top tier");
    assert_eq!(distributed.stats_snapshot().hits, 1);

    let second = manager.get("b", None).await.unwrap();
    assert_eq!(second.unwrap().value(), Some(&b"2"[..]));
    assert_eq!(top.stats_snapshot().hits, 1, "second read should hit the top tier");
    assert_eq!(
        distributed.stats_snapshot().hits, 1,
        "distributed tier is not consulted once a closer tier hits"
    );
}
