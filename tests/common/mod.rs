//! Shared fixtures for the integration suite: an in-memory tier and an
//! in-process broadcast broker standing in for the out-of-scope concrete
//! tier/broker implementations the core depends on only as contracts.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tiered_cache_core::item::{CacheItem, ExpirationMode, Identity, ValueType};
use tiered_cache_core::stats::TierStats;
use tiered_cache_core::tier::{CacheTier, UpdateFactory, UpdateOutcome};
use tiered_cache_core::Broker;
use tokio::sync::broadcast;

pub fn item(key: &str, value: &[u8]) -> CacheItem {
    CacheItem::new(
        Identity::new(key, None::<String>).unwrap(),
        Some(value.to_vec()),
        ValueType::new("bytes"),
        ExpirationMode::None,
        Duration::ZERO,
        false,
    )
    .unwrap()
}

/// A bare in-memory tier, the same shape a host would write against
/// [`CacheTier`] for an LRU or similar. Not shipped by the core itself.
#[derive(Default)]
pub struct MemTier {
    name: String,
    is_source: bool,
    store: Mutex<HashMap<Identity, CacheItem>>,
    stats: TierStats,
}

impl MemTier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_source: false,
            store: Mutex::new(HashMap::new()),
            stats: TierStats::new(),
        }
    }

    #[must_use]
    pub fn as_source(mut self) -> Self {
        self.is_source = true;
        self
    }

    pub fn contains(&self, key: &str, region: Option<&str>) -> bool {
        let id = Identity::new(key, region).unwrap();
        self.store.lock().contains_key(&id)
    }

    pub fn stats_snapshot(&self) -> tiered_cache_core::stats::TierStatsSnapshot {
        self.stats.snapshot()
    }
}

#[async_trait]
impl CacheTier for MemTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_backplane_source(&self) -> bool {
        self.is_source
    }

    fn is_distributed(&self) -> bool {
        self.is_source
    }

    fn stats(&self) -> &TierStats {
        &self.stats
    }

    async fn add_async(&self, item: CacheItem) -> anyhow::Result<bool> {
        let mut store = self.store.lock();
        let id = item.identity().clone();
        if store.contains_key(&id) {
            self.stats.record_add(false);
            return Ok(false);
        }
        store.insert(id, item);
        self.stats.record_add(true);
        Ok(true)
    }

    async fn put_async(&self, item: CacheItem) -> anyhow::Result<()> {
        let mut store = self.store.lock();
        let id = item.identity().clone();
        let was_new = !store.contains_key(&id);
        store.insert(id, item);
        self.stats.record_put(was_new);
        Ok(())
    }

    async fn get_async(&self, key: &str, region: Option<&str>) -> anyhow::Result<Option<CacheItem>> {
        let id = Identity::new(key, region)?;
        let store = self.store.lock();
        match store.get(&id) {
            Some(item) => {
                self.stats.record_hit();
                Ok(Some(item.clone()))
            }
            None => {
                self.stats.record_miss();
                Ok(None)
            }
        }
    }

    async fn remove_async(&self, key: &str, region: Option<&str>) -> anyhow::Result<bool> {
        let id = Identity::new(key, region)?;
        let removed = self.store.lock().remove(&id).is_some();
        self.stats.record_remove(removed);
        Ok(removed)
    }

    async fn exists_async(&self, key: &str, region: Option<&str>) -> anyhow::Result<bool> {
        let id = Identity::new(key, region)?;
        Ok(self.store.lock().contains_key(&id))
    }

    async fn update_async(
        &self,
        key: &str,
        region: Option<&str>,
        factory: &UpdateFactory,
        _max_retries: u32,
    ) -> anyhow::Result<UpdateOutcome> {
        let id = Identity::new(key, region)?;
        // Read-modify-write atomically under one lock acquisition: the
        // factory is a plain synchronous function, so holding the lock
        // across it (rather than across an `.await`) is safe and gives a
        // real compare-and-swap instead of a read/compute/write race.
        let mut store = self.store.lock();
        let current = store.get(&id).cloned();
        let Some(proposed) = factory(current.as_ref()) else {
            return Ok(UpdateOutcome::Unchanged);
        };
        let was_new = !store.contains_key(&id);
        store.insert(id, proposed.clone());
        drop(store);
        self.stats.record_put(was_new);
        Ok(UpdateOutcome::Updated(proposed))
    }

    async fn clear_async(&self) -> anyhow::Result<()> {
        self.store.lock().clear();
        self.stats.record_clear();
        Ok(())
    }

    async fn clear_region_async(&self, region: &str) -> anyhow::Result<()> {
        self.store.lock().retain(|id, _| id.region() != Some(region));
        self.stats.record_clear_region();
        Ok(())
    }
}

/// An in-process broker standing in for a shared broker process: every
/// clone of the same `Arc<InProcessBroker>` publishes onto the same
/// `tokio::sync::broadcast` channel, so two `CacheManager`s built on top
/// of it behave as if they shared a real pub/sub backplane.
pub struct InProcessBroker {
    tx: broadcast::Sender<Bytes>,
    published: Mutex<Vec<Bytes>>,
}

impl InProcessBroker {
    #[must_use]
    pub fn new_shared() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            tx,
            published: Mutex::new(Vec::new()),
        })
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().len()
    }
}

pub struct InProcessSubscription {
    rx: broadcast::Receiver<Bytes>,
}

#[async_trait]
impl tiered_cache_core::BrokerSubscription for InProcessSubscription {
    async fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
impl Broker for InProcessBroker {
    async fn publish(&self, _channel: &str, payload: Bytes) -> anyhow::Result<()> {
        self.published.lock().push(payload.clone());
        // Ignore "no receivers": a publish before any manager subscribed is
        // still a successful publish from the broker's point of view.
        let _ = self.tx.send(payload);
        Ok(())
    }

    async fn subscribe(&self, _channel: &str) -> anyhow::Result<Box<dyn tiered_cache_core::BrokerSubscription>> {
        Ok(Box::new(InProcessSubscription {
            rx: self.tx.subscribe(),
        }))
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn server_version(&self) -> anyhow::Result<String> {
        Ok("in-process-test-broker-1.0".to_string())
    }
}
