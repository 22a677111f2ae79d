//! The tier (cache handle) contract.
//!
//! A tier is owned by exactly one [`crate::manager::CacheManager`] and
//! sits at one position in its ordered stack: index 0 is the
//! fastest/topmost tier, the last index is the bottommost (typically the
//! authoritative distributed tier).

use crate::item::{CacheItem, ExpirationMode};
use crate::stats::TierStats;
use async_trait::async_trait;
use std::time::Duration;

/// A pure function from the current value at a key (`None` if absent) to
/// the new value to store (`None` to leave unchanged / abort the write).
/// Must be safe to invoke multiple times: tiers retry it internally on
/// concurrent collision.
pub type UpdateFactory = Box<dyn Fn(Option<&CacheItem>) -> Option<CacheItem> + Send + Sync>;

/// Outcome of a tier-level `update`.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// The read-modify-write converged; carries the item that is now
    /// stored.
    Updated(CacheItem),
    /// The factory declined to produce a new value; nothing was written.
    Unchanged,
    /// The tier retried up to its internal limit without converging.
    NeedsRetry,
}

/// Blocks on a future using the current Tokio runtime. Used by the
/// default sync entry points below: the cooperative core runs regardless
/// of caller, and the sync surface is a blocking wrapper around it where
/// a runtime is available, per the source system's split sync/async
/// halves of one logical operation.
///
/// # Panics
///
/// Panics if called outside a Tokio runtime context.
pub(crate) fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
}

/// The contract every cache tier must satisfy. Async methods are the
/// cooperative core; the sync methods are blocking wrappers with default
/// implementations in terms of them, so implementors only need to
/// implement the `_async` half. A tier that genuinely has no async
/// support underneath (e.g. a blocking on-disk store) may override the
/// sync methods directly and give the `_async` methods a trivial
/// already-completed-result body.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Unique name within one manager.
    fn name(&self) -> &str;

    /// Whether this tier is the backplane source — the authoritative tier
    /// that inbound backplane messages never mutate locally. At most one
    /// tier in a manager's stack should answer true.
    fn is_backplane_source(&self) -> bool {
        false
    }

    /// Whether this tier is a distributed store (informational; affects
    /// nothing in the core beyond diagnostics).
    fn is_distributed(&self) -> bool {
        false
    }

    /// Default expiration mode applied when an item's
    /// `uses_expiration_defaults` flag is set.
    fn default_expiration_mode(&self) -> ExpirationMode {
        ExpirationMode::None
    }

    /// Default expiration timeout paired with `default_expiration_mode`.
    fn default_expiration_timeout(&self) -> Duration {
        Duration::ZERO
    }

    /// This tier's statistics block.
    fn stats(&self) -> &TierStats;

    /// Insert `item` only if no live item exists for its `(region, key)`.
    /// Returns `false` on conflict without overwriting the existing item.
    async fn add_async(&self, item: CacheItem) -> anyhow::Result<bool>;

    /// Unconditional insert/overwrite.
    async fn put_async(&self, item: CacheItem) -> anyhow::Result<()>;

    /// Fetch the stored item, if any and not expired. Must not mutate
    /// `last_accessed_utc` — the manager owns that.
    async fn get_async(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> anyhow::Result<Option<CacheItem>>;

    /// Remove the item for `(region, key)`. Returns `true` iff something
    /// was removed.
    async fn remove_async(&self, key: &str, region: Option<&str>) -> anyhow::Result<bool>;

    /// Check for presence without fetching the value.
    async fn exists_async(&self, key: &str, region: Option<&str>) -> anyhow::Result<bool>;

    /// Read-modify-write against this tier's own concurrency primitives.
    /// On a concurrent collision the tier retries internally, consulting
    /// `factory` again against the freshly-read value, up to
    /// `max_retries` times before reporting [`UpdateOutcome::NeedsRetry`].
    async fn update_async(
        &self,
        key: &str,
        region: Option<&str>,
        factory: &UpdateFactory,
        max_retries: u32,
    ) -> anyhow::Result<UpdateOutcome>;

    /// Remove every item in this tier.
    async fn clear_async(&self) -> anyhow::Result<()>;

    /// Remove every item in `region` from this tier.
    async fn clear_region_async(&self, region: &str) -> anyhow::Result<()>;

    /// Release any resources this tier holds (connections, background
    /// tasks). Called by the manager during disposal, bottommost tier
    /// first to last, i.e. the reverse of the stack's lookup order.
    /// Default is a no-op: most tiers own nothing beyond what `Drop`
    /// already handles.
    async fn dispose_async(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Blocking wrapper around [`CacheTier::add_async`].
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime context.
    fn add(&self, item: CacheItem) -> anyhow::Result<bool> {
        block_on(self.add_async(item))
    }

    /// Blocking wrapper around [`CacheTier::put_async`].
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime context.
    fn put(&self, item: CacheItem) -> anyhow::Result<()> {
        block_on(self.put_async(item))
    }

    /// Blocking wrapper around [`CacheTier::get_async`].
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime context.
    fn get(&self, key: &str, region: Option<&str>) -> anyhow::Result<Option<CacheItem>> {
        block_on(self.get_async(key, region))
    }

    /// Blocking wrapper around [`CacheTier::remove_async`].
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime context.
    fn remove(&self, key: &str, region: Option<&str>) -> anyhow::Result<bool> {
        block_on(self.remove_async(key, region))
    }

    /// Blocking wrapper around [`CacheTier::exists_async`].
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime context.
    fn exists(&self, key: &str, region: Option<&str>) -> anyhow::Result<bool> {
        block_on(self.exists_async(key, region))
    }

    /// Blocking wrapper around [`CacheTier::clear_async`].
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime context.
    fn clear(&self) -> anyhow::Result<()> {
        block_on(self.clear_async())
    }

    /// Blocking wrapper around [`CacheTier::clear_region_async`].
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime context.
    fn clear_region(&self, region: &str) -> anyhow::Result<()> {
        block_on(self.clear_region_async(region))
    }

    /// Blocking wrapper around [`CacheTier::dispose_async`].
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime context.
    fn dispose(&self) -> anyhow::Result<()> {
        block_on(self.dispose_async())
    }
}
