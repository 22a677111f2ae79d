//! Error kinds for the cache manager, connection supervisor, and backplane.
//!
//! Tier and broker implementations are external collaborators and report
//! failures through `anyhow::Result` (the plug-in boundary); this module
//! is for errors the core itself raises or elevates.

use thiserror::Error;

/// Errors raised by the cache manager, connection supervisor, and backplane.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A null/empty key, empty region on a region-qualified call, or other
    /// invalid argument was supplied.
    #[error("invalid argument: {0}")]
    ArgumentInvalid(String),

    /// The manager (or a resource it owns) was used after disposal.
    #[error("cache manager already disposed")]
    AlreadyDisposed,

    /// The backing distributed store is unreachable after exhausting retries.
    #[error("backing store unavailable: {0}")]
    BackingStoreUnavailable(String),

    /// A peer responded with an unrecognized/incompatible command; never
    /// retried.
    #[error("incompatible peer: {0}")]
    IncompatiblePeer(String),

    /// A read-modify-write `update` exhausted its retry budget without
    /// converging.
    #[error("update conflict exhausted after {attempts} attempt(s) for key '{key}'")]
    UpdateConflictExhausted {
        /// Key (and implicit region) the update targeted.
        key: String,
        /// Number of attempts the tier made before giving up.
        attempts: u32,
    },

    /// Encoding or decoding a cache value or backplane frame failed.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// No connected server was available to probe for feature capabilities.
    #[error("no connected server available")]
    NoConnectedServer,
}

/// Classifies an opaque broker/tier error as transient (worth retrying) or
/// terminal. Connection Supervisor retry loop consults this. The whole
/// cause chain is inspected, not just the top-level message: a broker error
/// built with `.context("...")` over a transient root cause must still be
/// recognized as transient, mirroring how the source system destructures
/// aggregate/multi-error conditions before deciding.
pub fn is_transient(err: &anyhow::Error) -> bool {
    let lower = format!("{err:#}").to_lowercase();

    if lower.contains("unknown command") {
        // Incompatible peer: never retried, regardless of other markers.
        return false;
    }

    lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection reset")
        || lower.contains("connection refused")
        || lower.contains("connection closed")
        || lower.contains("broken pipe")
        || lower.contains("transient")
        || lower.contains("try again")
        || lower.contains("temporarily unavailable")
}
