//! The cache item envelope exchanged between callers, tiers, and the
//! backplane.

use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// How an item's lifetime is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpirationMode {
    /// Item never expires.
    None,
    /// Item expires at `created_utc + expiration_timeout`, regardless of
    /// access pattern.
    Absolute,
    /// Item's expiration slides forward by `expiration_timeout` on every
    /// access.
    Sliding,
    /// Inherit whatever default the tier that stores the item applies.
    Default,
}

/// Identity of an item within one logical cache: an optional namespace
/// plus a key. An absent region and an empty-string region are the same
/// thing (see `Identity::new`); a present, non-empty region is a distinct
/// namespace from the absent one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    key: String,
    region: Option<String>,
}

impl Identity {
    /// Build an identity, normalizing an empty-string region to "no region".
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::ArgumentInvalid`] if `key` is empty.
    pub fn new(key: impl Into<String>, region: Option<impl Into<String>>) -> Result<Self, CacheError> {
        let key = key.into();
        if key.is_empty() {
            return Err(CacheError::ArgumentInvalid("key must not be empty".into()));
        }
        let region = region
            .map(std::convert::Into::into)
            .filter(|r: &String| !r.is_empty());
        Ok(Self { key, region })
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }
}

/// A typed-value descriptor sufficient to reconstruct a value after
/// deserialization. The core treats this as an opaque label; codecs and
/// host applications give it meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueType(pub String);

impl ValueType {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

/// The unit of exchange between caller, tiers, and the backplane.
///
/// Items are treated as immutable across tiers except for
/// `last_accessed_utc`, which the [`crate::manager::CacheManager`] updates
/// on successful reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheItem {
    identity: Identity,
    /// Opaque payload; absent on remove/clear-shaped messages.
    value: Option<Vec<u8>>,
    value_type: ValueType,
    expiration_mode: ExpirationMode,
    expiration_timeout: Duration,
    created_utc: SystemTime,
    last_accessed_utc: SystemTime,
    /// Distinguishes "explicitly `ExpirationMode::None`" from "inherit the
    /// tier's defaults" at the wire/storage boundary.
    uses_expiration_defaults: bool,
}

impl CacheItem {
    /// Build a new item, validating the expiration invariants from the
    /// data model: a non-`None` mode needs a positive timeout, and
    /// `last_accessed_utc` never precedes `created_utc`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::ArgumentInvalid`] if `expiration_mode` is not
    /// `None` and `expiration_timeout` is zero.
    pub fn new(
        identity: Identity,
        value: Option<Vec<u8>>,
        value_type: ValueType,
        expiration_mode: ExpirationMode,
        expiration_timeout: Duration,
        uses_expiration_defaults: bool,
    ) -> Result<Self, CacheError> {
        if expiration_mode != ExpirationMode::None && expiration_timeout.is_zero() {
            return Err(CacheError::ArgumentInvalid(
                "expiration_timeout must be > 0 when expiration_mode is not None".into(),
            ));
        }
        let now = SystemTime::now();
        Ok(Self {
            identity,
            value,
            value_type,
            expiration_mode,
            expiration_timeout,
            created_utc: now,
            last_accessed_utc: now,
            uses_expiration_defaults,
        })
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn key(&self) -> &str {
        self.identity.key()
    }

    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.identity.region()
    }

    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    #[must_use]
    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }

    #[must_use]
    pub fn expiration_mode(&self) -> ExpirationMode {
        self.expiration_mode
    }

    #[must_use]
    pub fn expiration_timeout(&self) -> Duration {
        self.expiration_timeout
    }

    #[must_use]
    pub fn created_utc(&self) -> SystemTime {
        self.created_utc
    }

    #[must_use]
    pub fn last_accessed_utc(&self) -> SystemTime {
        self.last_accessed_utc
    }

    #[must_use]
    pub fn uses_expiration_defaults(&self) -> bool {
        self.uses_expiration_defaults
    }

    /// Returns true if an absolute-expiration item's deadline has passed.
    /// Sliding expiration is evaluated by the tier on access (it alone
    /// knows the last touch time it is enforcing); this only judges the
    /// absolute case, which is timeline-independent of access pattern.
    #[must_use]
    pub fn is_absolutely_expired(&self, now: SystemTime) -> bool {
        self.expiration_mode == ExpirationMode::Absolute
            && now
                .duration_since(self.created_utc)
                .is_ok_and(|elapsed| elapsed >= self.expiration_timeout)
    }

    /// Record a successful read. Per the data model, this is the only
    /// field a tier/manager may mutate post-construction.
    pub fn touch(&mut self, now: SystemTime) {
        if now >= self.last_accessed_utc {
            self.last_accessed_utc = now;
        }
    }

    /// Clone this item with a freshly-touched `last_accessed_utc`, leaving
    /// the original untouched. Used by the manager when promoting a value
    /// read from a lower tier into upper tiers without losing the shared
    /// original.
    #[must_use]
    pub fn with_touch(&self, now: SystemTime) -> Self {
        let mut clone = self.clone();
        clone.touch(now);
        clone
    }

    /// Encode this item's envelope (identity, metadata, and opaque value
    /// bytes) as JSON: the crate's default codec path for a host that wants
    /// to log, export, or move a whole item across a boundary that isn't
    /// the tier stack. This does not interpret `value` itself — a typed
    /// value's own encoding is a concern of the host's codec, not the core.
    ///
    /// # Errors
    /// Returns [`CacheError::SerializationError`] if encoding fails.
    pub fn to_json(&self) -> Result<String, CacheError> {
        serde_json::to_string(self).map_err(|e| CacheError::SerializationError(e.to_string()))
    }

    /// Decode an item envelope previously produced by [`CacheItem::to_json`].
    ///
    /// # Errors
    /// Returns [`CacheError::SerializationError`] if `json` is not a valid
    /// encoded envelope.
    pub fn from_json(json: &str) -> Result<Self, CacheError> {
        serde_json::from_str(json).map_err(|e| CacheError::SerializationError(e.to_string()))
    }
}
