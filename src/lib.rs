//! Core of a multi-tier cache coordination library.
//!
//! Composes an ordered stack of cache tiers (fastest/topmost first,
//! authoritative/bottommost last) into one logical cache with
//! write-through, read-through promotion, per-tier statistics, and
//! cross-process invalidation via a batching pub/sub backplane.
//!
//! This crate is the orchestration core only. Concrete tier
//! implementations (an in-memory LRU, a distributed KV store, ...),
//! serialization codecs, and networking to the shared broker are external
//! collaborators a host application supplies against the [`tier::CacheTier`],
//! and [`connection::Broker`] contracts.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use tiered_cache_core::item::{CacheItem, ExpirationMode, Identity, ValueType};
//! use tiered_cache_core::manager::ManagerBuilder;
//! # use tiered_cache_core::tier::CacheTier;
//! # use std::sync::Arc;
//!
//! # async fn example(topmost: Arc<dyn CacheTier>, bottommost: Arc<dyn CacheTier>) -> anyhow::Result<()> {
//! let manager = ManagerBuilder::new()
//!     .with_tier(topmost)
//!     .with_tier(bottommost)
//!     .build()
//!     .await?;
//!
//! let item = CacheItem::new(
//!     Identity::new("user:1", None::<String>)?,
//!     Some(b"alice".to_vec()),
//!     ValueType::new("bytes"),
//!     ExpirationMode::None,
//!     std::time::Duration::ZERO,
//!     false,
//! )?;
//! manager.put(item).await?;
//! let fetched = manager.get("user:1", None).await?;
//! assert!(fetched.is_some());
//! # Ok(())
//! # }
//! ```

pub mod backplane;
pub mod connection;
pub mod error;
pub mod item;
pub mod manager;
pub mod stats;
pub mod tier;

pub use backplane::{
    decode_frame, encode_frame, BackplaneConfig, BackplaneHandler, BackplaneMessage,
    BackplanePublisher, BackplaneSubscriber, ChangeAction,
};
pub use connection::{redact_credentials, Broker, BrokerSubscription, ConnectionConfig, ConnectionSupervisor, Dialer, FeatureSet};
pub use error::{is_transient, CacheError};
pub use item::{CacheItem, ExpirationMode, Identity, ValueType};
pub use manager::{CacheManager, ManagerBuilder, ManagerStatsSnapshot, UpdateResult};
pub use stats::{CacheEvent, EventListeners, Observer, TierStats, TierStatsSnapshot};
pub use tier::{CacheTier, UpdateFactory, UpdateOutcome};

pub use async_trait::async_trait;
