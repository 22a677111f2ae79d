//! Per-tier counters and observer fan-out.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for a single tier. Reads are lock-free and may be
/// slightly stale relative to concurrent writers; that is an accepted
/// trade-off per the concurrency model, not a bug.
#[derive(Debug, Default)]
pub struct TierStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub items: AtomicU64,
    pub add_calls: AtomicU64,
    pub put_calls: AtomicU64,
    pub remove_calls: AtomicU64,
    pub clear_calls: AtomicU64,
    pub clear_region_calls: AtomicU64,
}

impl TierStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_add(&self, succeeded: bool) {
        self.add_calls.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.items.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_put(&self, was_new: bool) {
        self.put_calls.fetch_add(1, Ordering::Relaxed);
        if was_new {
            self.items.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_remove(&self, removed: bool) {
        self.remove_calls.fetch_add(1, Ordering::Relaxed);
        if removed {
            self.items.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn record_clear(&self) {
        self.clear_calls.fetch_add(1, Ordering::Relaxed);
        self.items.store(0, Ordering::Relaxed);
    }

    pub fn record_clear_region(&self) {
        self.clear_region_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough point-in-time copy for reporting.
    #[must_use]
    pub fn snapshot(&self) -> TierStatsSnapshot {
        TierStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            items: self.items.load(Ordering::Relaxed),
            add_calls: self.add_calls.load(Ordering::Relaxed),
            put_calls: self.put_calls.load(Ordering::Relaxed),
            remove_calls: self.remove_calls.load(Ordering::Relaxed),
            clear_calls: self.clear_calls.load(Ordering::Relaxed),
            clear_region_calls: self.clear_region_calls.load(Ordering::Relaxed),
        }
    }
}

/// An owned point-in-time copy of [`TierStats`], safe to log or export
/// without holding a reference into the tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub items: u64,
    pub add_calls: u64,
    pub put_calls: u64,
    pub remove_calls: u64,
    pub clear_calls: u64,
    pub clear_region_calls: u64,
}

impl TierStatsSnapshot {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.hits as f64 / total as f64
            }
        }
    }
}

/// Events the manager fires to registered observers. Each high-level
/// operation fires its event at most once, regardless of how many tiers
/// it touched.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    OnAdd { key: String, region: Option<String>, success: bool },
    OnPut { key: String, region: Option<String> },
    OnGet { key: String, region: Option<String>, found: bool },
    OnUpdate { key: String, region: Option<String>, success: bool },
    OnRemove { key: String, region: Option<String>, removed: bool },
    OnClear,
    OnClearRegion { region: String },
}

/// An observer callback. Boxed so a manager can hold a heterogeneous list
/// of closures and trait-object handlers alike.
pub type Observer = Box<dyn Fn(&CacheEvent) + Send + Sync>;

/// Synchronous fan-out to registered observers with per-observer error
/// isolation: an observer that panics is caught and logged, and never
/// prevents the remaining observers from running or affects the
/// triggering cache operation.
#[derive(Default)]
pub struct EventListeners {
    observers: parking_lot::Mutex<Vec<Observer>>,
}

impl EventListeners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Observer) {
        self.observers.lock().push(observer);
    }

    pub fn fire(&self, event: &CacheEvent) {
        let observers = self.observers.lock();
        for observer in observers.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| observer(event)));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic payload>".to_string());
                tracing::error!(event = ?event, %message, "cache event observer panicked");
            }
        }
    }
}

impl std::fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListeners")
            .field("count", &self.observers.lock().len())
            .finish()
    }
}
