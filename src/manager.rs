//! The cache manager: orchestrates an ordered tier stack and an optional
//! backplane into the single coherent read-through/write-through API
//! callers see.

use crate::backplane::{
    BackplaneConfig, BackplaneHandler, BackplaneMessage, BackplanePublisher, BackplaneSubscriber,
    ChangeAction,
};
use crate::connection::Broker;
use crate::error::CacheError;
use crate::item::CacheItem;
use crate::stats::{CacheEvent, EventListeners, Observer, TierStatsSnapshot};
use crate::tier::{block_on, CacheTier, UpdateFactory, UpdateOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Result of [`CacheManager::update`]: a converged update either produced
/// a new value or the factory declined to change anything.
#[derive(Debug)]
pub enum UpdateResult {
    Updated(CacheItem),
    Unchanged,
}

struct BackplaneWiring {
    publisher: Arc<BackplanePublisher>,
    subscriber: BackplaneSubscriber,
    broker: Arc<dyn Broker>,
    channel: String,
    shutdown: broadcast::Sender<()>,
}

struct Inner {
    tiers: Vec<Arc<dyn CacheTier>>,
    backplane: Option<BackplaneWiring>,
    listeners: EventListeners,
    disposed: AtomicBool,
    update_max_retries: u32,
    disposal_deadline: Duration,
}

/// A handle over an ordered tier stack (topmost/fastest at index 0,
/// bottommost/authoritative last) plus an optional cross-process
/// backplane. Cheap to clone: internally an `Arc`, following the same
/// wrapper-around-inner pattern the teacher uses to keep its manager
/// handle `Clone` without cloning the tier stack itself.
#[derive(Clone)]
pub struct CacheManager(Arc<Inner>);

/// A point-in-time copy of every tier's stats, safe to log or export.
#[derive(Debug, Clone)]
pub struct ManagerStatsSnapshot {
    pub tiers: Vec<(String, TierStatsSnapshot)>,
}

impl CacheManager {
    fn ensure_not_disposed(&self) -> Result<(), CacheError> {
        if self.0.disposed.load(Ordering::Acquire) {
            return Err(CacheError::AlreadyDisposed);
        }
        Ok(())
    }

    fn bottommost(&self) -> &Arc<dyn CacheTier> {
        self.0
            .tiers
            .last()
            .expect("ManagerBuilder guarantees at least one tier")
    }

    fn upper_tiers(&self) -> &[Arc<dyn CacheTier>] {
        let len = self.0.tiers.len();
        &self.0.tiers[..len.saturating_sub(1)]
    }

    async fn evict_from_other_tiers(&self, source_index: usize, key: &str, region: Option<&str>) {
        for (i, tier) in self.0.tiers.iter().enumerate() {
            if i == source_index {
                continue;
            }
            if let Err(err) = tier.remove_async(key, region).await {
                warn!(tier = tier.name(), error = %err, "failed to evict from tier after authoritative write");
            }
        }
    }

    async fn publish(&self, message: BackplaneMessage) {
        if let Some(wiring) = &self.0.backplane {
            wiring.publisher.enqueue_and_schedule_flush(message).await;
        }
    }

    /// Insert `item` only if no live item exists for its identity.
    /// Authoritative on the bottommost tier: on success, the key is
    /// evicted from every other tier (instead of written through) so the
    /// next `get` promotes the authoritative copy rather than serving a
    /// stale upper-tier miss-then-insert race.
    ///
    /// # Errors
    /// Returns [`CacheError::AlreadyDisposed`] if the manager has been
    /// disposed, or [`CacheError::BackingStoreUnavailable`] if the
    /// bottommost tier's write fails.
    pub async fn add(&self, item: CacheItem) -> Result<bool, CacheError> {
        self.ensure_not_disposed()?;
        let key = item.key().to_string();
        let region = item.region().map(String::from);
        let bottommost_index = self.0.tiers.len() - 1;

        let inserted = self
            .bottommost()
            .add_async(item)
            .await
            .map_err(|e| CacheError::BackingStoreUnavailable(e.to_string()))?;

        if inserted {
            self.evict_from_other_tiers(bottommost_index, &key, region.as_deref())
                .await;
            self.publish(BackplaneMessage::Changed {
                sender: self.sender_id(),
                key: key.clone(),
                region: region.clone(),
                action: ChangeAction::Add,
            })
            .await;
        }

        self.0.listeners.fire(&CacheEvent::OnAdd {
            key,
            region,
            success: inserted,
        });
        Ok(inserted)
    }

    /// Write `item` through every tier unconditionally.
    ///
    /// # Errors
    /// Returns [`CacheError::AlreadyDisposed`] or
    /// [`CacheError::BackingStoreUnavailable`] if any tier's write fails.
    pub async fn put(&self, item: CacheItem) -> Result<(), CacheError> {
        self.ensure_not_disposed()?;
        let key = item.key().to_string();
        let region = item.region().map(String::from);

        for tier in &self.0.tiers {
            tier.put_async(item.clone())
                .await
                .map_err(|e| CacheError::BackingStoreUnavailable(e.to_string()))?;
        }

        self.publish(BackplaneMessage::Changed {
            sender: self.sender_id(),
            key: key.clone(),
            region: region.clone(),
            action: ChangeAction::Put,
        })
        .await;
        self.0.listeners.fire(&CacheEvent::OnPut { key, region });
        Ok(())
    }

    /// Read through the tier stack top-down, promoting a lower-tier hit
    /// into every tier above it via `put` (an overwrite, not an `add`:
    /// the source tier is already authoritative for this value). A full
    /// miss touches no tier and is not announced on the backplane.
    ///
    /// # Errors
    /// Returns [`CacheError::AlreadyDisposed`] or
    /// [`CacheError::BackingStoreUnavailable`] if a tier read fails.
    pub async fn get(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> Result<Option<CacheItem>, CacheError> {
        self.ensure_not_disposed()?;

        for (i, tier) in self.0.tiers.iter().enumerate() {
            let found = tier
                .get_async(key, region)
                .await
                .map_err(|e| CacheError::BackingStoreUnavailable(e.to_string()))?;
            let Some(item) = found else { continue };

            let touched = item.with_touch(SystemTime::now());
            for upper in &self.0.tiers[..i] {
                if let Err(err) = upper.put_async(touched.clone()).await {
                    warn!(tier = upper.name(), error = %err, "failed to promote item into upper tier");
                }
            }

            self.0.listeners.fire(&CacheEvent::OnGet {
                key: key.to_string(),
                region: region.map(String::from),
                found: true,
            });
            return Ok(Some(touched));
        }

        self.0.listeners.fire(&CacheEvent::OnGet {
            key: key.to_string(),
            region: region.map(String::from),
            found: false,
        });
        Ok(None)
    }

    /// Check presence across the tier stack without promoting or
    /// mutating access time.
    ///
    /// # Errors
    /// Returns [`CacheError::AlreadyDisposed`] or
    /// [`CacheError::BackingStoreUnavailable`] if a tier check fails.
    pub async fn exists(&self, key: &str, region: Option<&str>) -> Result<bool, CacheError> {
        self.ensure_not_disposed()?;
        for tier in &self.0.tiers {
            if tier
                .exists_async(key, region)
                .await
                .map_err(|e| CacheError::BackingStoreUnavailable(e.to_string()))?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove `(key, region)` from every tier. Fires `OnRemove` exactly
    /// once with the OR of every tier's result, and announces the
    /// removal on the backplane if any tier actually had it.
    ///
    /// # Errors
    /// Returns [`CacheError::AlreadyDisposed`] or
    /// [`CacheError::BackingStoreUnavailable`] if a tier removal fails.
    pub async fn remove(&self, key: &str, region: Option<&str>) -> Result<bool, CacheError> {
        self.ensure_not_disposed()?;
        let mut removed_anywhere = false;
        for tier in &self.0.tiers {
            let removed = tier
                .remove_async(key, region)
                .await
                .map_err(|e| CacheError::BackingStoreUnavailable(e.to_string()))?;
            removed_anywhere |= removed;
        }

        if removed_anywhere {
            self.publish(BackplaneMessage::Removed {
                sender: self.sender_id(),
                key: key.to_string(),
                region: region.map(String::from),
            })
            .await;
        }

        self.0.listeners.fire(&CacheEvent::OnRemove {
            key: key.to_string(),
            region: region.map(String::from),
            removed: removed_anywhere,
        });
        Ok(removed_anywhere)
    }

    /// Read-modify-write against the bottommost (authoritative) tier.
    /// On convergence, evicts the key from every other tier and
    /// announces the change; a factory that declines to change anything
    /// touches no other tier and publishes nothing.
    ///
    /// # Errors
    /// Returns [`CacheError::UpdateConflictExhausted`] if the bottommost
    /// tier's internal retry budget is exhausted, or
    /// [`CacheError::BackingStoreUnavailable`] on a tier failure.
    pub async fn update(
        &self,
        key: &str,
        region: Option<&str>,
        factory: UpdateFactory,
        max_retries: Option<u32>,
    ) -> Result<UpdateResult, CacheError> {
        self.ensure_not_disposed()?;
        let max_retries = max_retries.unwrap_or(self.0.update_max_retries);
        let bottommost_index = self.0.tiers.len() - 1;

        let outcome = self
            .bottommost()
            .update_async(key, region, &factory, max_retries)
            .await
            .map_err(|e| CacheError::BackingStoreUnavailable(e.to_string()))?;

        match outcome {
            UpdateOutcome::Updated(item) => {
                self.evict_from_other_tiers(bottommost_index, key, region).await;
                self.publish(BackplaneMessage::Changed {
                    sender: self.sender_id(),
                    key: key.to_string(),
                    region: region.map(String::from),
                    action: ChangeAction::Update,
                })
                .await;
                self.0.listeners.fire(&CacheEvent::OnUpdate {
                    key: key.to_string(),
                    region: region.map(String::from),
                    success: true,
                });
                Ok(UpdateResult::Updated(item))
            }
            UpdateOutcome::Unchanged => {
                self.0.listeners.fire(&CacheEvent::OnUpdate {
                    key: key.to_string(),
                    region: region.map(String::from),
                    success: true,
                });
                Ok(UpdateResult::Unchanged)
            }
            UpdateOutcome::NeedsRetry => {
                self.0.listeners.fire(&CacheEvent::OnUpdate {
                    key: key.to_string(),
                    region: region.map(String::from),
                    success: false,
                });
                Err(CacheError::UpdateConflictExhausted {
                    key: key.to_string(),
                    attempts: max_retries,
                })
            }
        }
    }

    /// Clear every tier, reset their stats, and announce the clear.
    ///
    /// # Errors
    /// Returns [`CacheError::AlreadyDisposed`] or
    /// [`CacheError::BackingStoreUnavailable`] if a tier clear fails.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.ensure_not_disposed()?;
        for tier in &self.0.tiers {
            tier.clear_async()
                .await
                .map_err(|e| CacheError::BackingStoreUnavailable(e.to_string()))?;
        }
        self.publish(BackplaneMessage::Clear {
            sender: self.sender_id(),
        })
        .await;
        self.0.listeners.fire(&CacheEvent::OnClear);
        Ok(())
    }

    /// Clear one region across every tier and announce the clear.
    ///
    /// # Errors
    /// Returns [`CacheError::AlreadyDisposed`] or
    /// [`CacheError::BackingStoreUnavailable`] if a tier clear fails.
    pub async fn clear_region(&self, region: &str) -> Result<(), CacheError> {
        self.ensure_not_disposed()?;
        for tier in &self.0.tiers {
            tier.clear_region_async(region)
                .await
                .map_err(|e| CacheError::BackingStoreUnavailable(e.to_string()))?;
        }
        self.publish(BackplaneMessage::ClearRegion {
            sender: self.sender_id(),
            region: region.to_string(),
        })
        .await;
        self.0.listeners.fire(&CacheEvent::OnClearRegion {
            region: region.to_string(),
        });
        Ok(())
    }

    /// Register an observer. Observers are fanned out to synchronously
    /// and in registration order; a panicking observer is caught,
    /// logged, and does not affect the others or the triggering
    /// operation.
    pub fn register_observer(&self, observer: Observer) {
        self.0.listeners.register(observer);
    }

    /// Snapshot every tier's stats in stack order.
    #[must_use]
    pub fn stats(&self) -> ManagerStatsSnapshot {
        ManagerStatsSnapshot {
            tiers: self
                .0
                .tiers
                .iter()
                .map(|t| (t.name().to_string(), t.stats().snapshot()))
                .collect(),
        }
    }

    fn sender_id(&self) -> Uuid {
        self.0
            .backplane
            .as_ref()
            .map_or_else(Uuid::nil, |w| w.publisher.sender_id())
    }

    /// Apply an inbound backplane frame: updates propagated by other
    /// processes never re-publish, and never touch the tier that is this
    /// manager's backplane source (it would already be authoritative for
    /// whatever it has).
    pub fn ingest_backplane_frame(&self, frame: &[u8]) {
        if let Some(wiring) = &self.0.backplane {
            wiring.subscriber.handle_frame(frame, self);
        }
    }

    fn non_source_tiers(&self) -> impl Iterator<Item = &Arc<dyn CacheTier>> {
        self.0.tiers.iter().filter(|t| !t.is_backplane_source())
    }

    /// Flush any pending backplane batch (bounded by the configured
    /// disposal deadline) and dispose every tier bottommost-first, the
    /// reverse of their lookup order.
    ///
    /// # Errors
    /// Returns [`CacheError::BackingStoreUnavailable`] if disposing a
    /// tier fails. Idempotent: calling `dispose` again after success is a
    /// no-op.
    pub async fn dispose(&self) -> Result<(), CacheError> {
        if self.0.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(wiring) = &self.0.backplane {
            let _ = wiring.shutdown.send(());
            if tokio::time::timeout(self.0.disposal_deadline, wiring.publisher.flush())
                .await
                .is_err()
            {
                warn!("backplane flush did not complete within the disposal deadline");
            }
        }

        for tier in self.0.tiers.iter().rev() {
            tier.dispose_async()
                .await
                .map_err(|e| CacheError::BackingStoreUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// Blocking wrapper around [`CacheManager::add`].
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime context.
    pub fn add_blocking(&self, item: CacheItem) -> Result<bool, CacheError> {
        block_on(self.add(item))
    }

    /// Blocking wrapper around [`CacheManager::get`].
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime context.
    pub fn get_blocking(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> Result<Option<CacheItem>, CacheError> {
        block_on(self.get(key, region))
    }
}

impl CacheManager {
    /// Evict `(key, region)` from every tier that is not this manager's
    /// backplane source, without re-publishing. Shared by the `Changed`
    /// and `Removed` inbound handlers: both mean "the authoritative copy
    /// moved on without us."
    fn evict_non_source(&self, key: &str, region: Option<&str>) {
        for tier in self.non_source_tiers() {
            let tier = tier.clone();
            let key = key.to_string();
            let region = region.map(String::from);
            tokio::spawn(async move {
                if let Err(err) = tier.remove_async(&key, region.as_deref()).await {
                    warn!(tier = tier.name(), error = %err, "failed to apply inbound invalidation");
                }
            });
        }
    }
}

impl BackplaneHandler for CacheManager {
    fn on_changed(&self, key: &str, region: Option<&str>, _action: ChangeAction) {
        self.evict_non_source(key, region);
    }

    fn on_removed(&self, key: &str, region: Option<&str>) {
        self.evict_non_source(key, region);
    }

    fn on_cleared(&self) {
        for tier in self.non_source_tiers() {
            let tier = tier.clone();
            tokio::spawn(async move {
                if let Err(err) = tier.clear_async().await {
                    warn!(tier = tier.name(), error = %err, "failed to apply inbound clear");
                }
            });
        }
    }

    fn on_cleared_region(&self, region: &str) {
        for tier in self.non_source_tiers() {
            let tier = tier.clone();
            let region = region.to_string();
            tokio::spawn(async move {
                if let Err(err) = tier.clear_region_async(&region).await {
                    warn!(tier = tier.name(), error = %err, "failed to apply inbound region clear");
                }
            });
        }
    }
}

/// Builds a [`CacheManager`], validating tier ordering and backplane
/// wiring before any tier is touched.
pub struct ManagerBuilder {
    tiers: Vec<Arc<dyn CacheTier>>,
    backplane: Option<(Arc<dyn Broker>, BackplaneConfig)>,
    update_max_retries: u32,
    disposal_deadline: Duration,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self {
            tiers: Vec::new(),
            backplane: None,
            update_max_retries: 3,
            disposal_deadline: Duration::from_millis(500),
        }
    }
}

impl ManagerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tier. Tiers are consulted in the order added: the first
    /// is topmost/fastest, the last is bottommost/authoritative.
    #[must_use]
    pub fn with_tier(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Wire a backplane over `broker`. Requires exactly one tier in the
    /// stack to report `is_backplane_source() == true`.
    #[must_use]
    pub fn with_backplane(mut self, broker: Arc<dyn Broker>, config: BackplaneConfig) -> Self {
        self.backplane = Some((broker, config));
        self
    }

    #[must_use]
    pub fn with_update_max_retries(mut self, max_retries: u32) -> Self {
        self.update_max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_disposal_deadline(mut self, deadline: Duration) -> Self {
        self.disposal_deadline = deadline;
        self
    }

    /// Validate and construct the manager, starting the backplane's
    /// flush loop and inbound subscription loop if one was configured.
    ///
    /// # Errors
    /// Returns [`CacheError::ArgumentInvalid`] if the tier stack is
    /// empty, more than one tier claims to be the backplane source, or a
    /// backplane was configured with no source tier to pair it with.
    pub async fn build(self) -> Result<CacheManager, CacheError> {
        if self.tiers.is_empty() {
            return Err(CacheError::ArgumentInvalid(
                "a manager needs at least one tier".to_string(),
            ));
        }
        let source_count = self.tiers.iter().filter(|t| t.is_backplane_source()).count();
        if source_count > 1 {
            return Err(CacheError::ArgumentInvalid(
                "at most one tier may be the backplane source".to_string(),
            ));
        }
        if self.backplane.is_some() && source_count == 0 {
            return Err(CacheError::ArgumentInvalid(
                "a backplane requires a designated source tier".to_string(),
            ));
        }

        let backplane = match self.backplane {
            Some((broker, config)) => {
                let sender_id = Uuid::new_v4();
                let publisher = Arc::new(BackplanePublisher::new(
                    sender_id,
                    config.clone(),
                    broker.clone(),
                ));
                let (shutdown_tx, publisher_shutdown_rx) = broadcast::channel(1);
                tokio::spawn(Arc::clone(&publisher).run(publisher_shutdown_rx));

                Some(BackplaneWiring {
                    publisher,
                    subscriber: BackplaneSubscriber::new(sender_id),
                    broker,
                    channel: config.channel,
                    shutdown: shutdown_tx,
                })
            }
            None => None,
        };

        let inner = Arc::new(Inner {
            tiers: self.tiers,
            backplane,
            listeners: EventListeners::new(),
            disposed: AtomicBool::new(false),
            update_max_retries: self.update_max_retries,
            disposal_deadline: self.disposal_deadline,
        });
        let manager = CacheManager(inner);

        if let Some(wiring) = &manager.0.backplane {
            let manager_for_loop = manager.clone();
            let broker = wiring.broker.clone();
            let channel = wiring.channel.clone();
            let mut shutdown_rx = wiring.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => return,
                        subscription = broker.subscribe(&channel) => {
                            match subscription {
                                Ok(mut sub) => loop {
                                    tokio::select! {
                                        _ = shutdown_rx.recv() => return,
                                        frame = sub.next_frame() => match frame {
                                            Some(frame) => manager_for_loop.ingest_backplane_frame(&frame),
                                            None => break,
                                        },
                                    }
                                },
                                Err(err) => {
                                    error!(error = %err, "failed to subscribe to backplane channel, retrying");
                                }
                            }
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            });
        }

        debug!(tiers = manager.0.tiers.len(), "cache manager built");
        Ok(manager)
    }
}
