//! Connection supervisor: a process-wide pool of shared broker
//! connections keyed by connection string, with retry and feature
//! probing around the broker's pub/sub contract.

use crate::error::{is_transient, CacheError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// The pub/sub + health contract the connection supervisor and backplane
/// consume. Networking to the actual broker is an external collaborator;
/// this crate only depends on this contract, not a concrete client.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` verbatim to `channel`.
    async fn publish(&self, channel: &str, payload: Bytes) -> anyhow::Result<()>;

    /// Subscribe to `channel`, returning a handle that yields subsequent
    /// published frames.
    async fn subscribe(&self, channel: &str) -> anyhow::Result<Box<dyn BrokerSubscription>>;

    /// True if this handle is healthy and has at least one writeable
    /// endpoint.
    async fn is_healthy(&self) -> bool;

    /// Server version string, used for feature probing.
    async fn server_version(&self) -> anyhow::Result<String>;

    /// Whether this connection targets a sharding proxy rather than a
    /// single addressable server. Feature probing falls back to a
    /// conservative default in that case rather than querying one shard
    /// and generalizing to all of them.
    fn is_sharding_proxy(&self) -> bool {
        false
    }
}

/// A live subscription returned by [`Broker::subscribe`].
#[async_trait]
pub trait BrokerSubscription: Send {
    /// Await the next published frame, or `None` once the subscription
    /// has permanently ended.
    async fn next_frame(&mut self) -> Option<Bytes>;
}

/// Configuration identifying one broker endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Opaque connection string. May embed `password=...`, which
    /// [`redact_credentials`] strips before the string reaches a log
    /// line.
    pub connection_string: String,
    /// When set, `features` returns this version's feature set without
    /// probing a live peer.
    pub strict_compatibility_version: Option<String>,
}

impl ConnectionConfig {
    #[must_use]
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            strict_compatibility_version: None,
        }
    }

    #[must_use]
    pub fn with_strict_compatibility(mut self, version: impl Into<String>) -> Self {
        self.strict_compatibility_version = Some(version.into());
        self
    }
}

/// Capabilities of a connected peer, as reported by [`ConnectionSupervisor::features`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSet {
    pub server_version: String,
    /// A sharding proxy can't be probed for a single authoritative
    /// version; this is a conservative default rather than the real
    /// capability set.
    pub conservative: bool,
}

impl FeatureSet {
    #[must_use]
    pub fn for_version(version: impl Into<String>) -> Self {
        Self {
            server_version: version.into(),
            conservative: false,
        }
    }

    #[must_use]
    pub fn conservative_default() -> Self {
        Self {
            server_version: "unknown".to_string(),
            conservative: true,
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Caller-supplied override for how a connection is established, for test
/// injection. Boxed and `Arc`-shared so the same dialer can back many
/// connect calls.
pub type Dialer =
    Arc<dyn Fn(ConnectionConfig) -> BoxFuture<'static, anyhow::Result<Arc<dyn Broker>>> + Send + Sync>;

/// Process-wide pool of shared broker connections, deduplicated across
/// however many [`crate::manager::CacheManager`]s live in one process.
///
/// The establishment closure for a given connection string runs at most
/// once under contention: concurrent callers racing on the same key all
/// await the same [`OnceCell`], the same way the teacher's request
/// coalescing map lets concurrent readers share one in-flight
/// computation instead of stampeding the backing store.
pub struct ConnectionSupervisor {
    connections: DashMap<String, Arc<OnceCell<Arc<dyn Broker>>>>,
    default_dialer: Dialer,
}

impl ConnectionSupervisor {
    #[must_use]
    pub fn new(default_dialer: Dialer) -> Self {
        Self {
            connections: DashMap::new(),
            default_dialer,
        }
    }

    /// Returns a cached connection for `config.connection_string`, or
    /// establishes a new one via the default dialer.
    ///
    /// # Errors
    /// Returns [`CacheError::BackingStoreUnavailable`] if establishment
    /// fails or the newly-established connection is not healthy.
    pub async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Broker>, CacheError> {
        self.connect_with(config, None).await
    }

    /// As [`ConnectionSupervisor::connect`], but with a caller-supplied
    /// dialer overriding the default for this call only (used by tests
    /// to inject a fake broker).
    ///
    /// # Errors
    /// Returns [`CacheError::BackingStoreUnavailable`] if establishment
    /// fails or the newly-established connection is not healthy.
    pub async fn connect_with(
        &self,
        config: &ConnectionConfig,
        dialer_override: Option<Dialer>,
    ) -> Result<Arc<dyn Broker>, CacheError> {
        let dialer = dialer_override.unwrap_or_else(|| self.default_dialer.clone());
        let cell = self
            .connections
            .entry(config.connection_string.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let config = config.clone();
        let redacted = redact_credentials(&config.connection_string);
        let broker = cell
            .get_or_try_init(|| async move {
                debug!(connection = %redacted, "establishing broker connection");
                let broker = dialer(config).await?;
                if !broker.is_healthy().await {
                    anyhow::bail!("newly established connection is not healthy");
                }
                Ok::<_, anyhow::Error>(broker)
            })
            .await
            .map_err(|e| CacheError::BackingStoreUnavailable(e.to_string()))?;

        Ok(broker.clone())
    }

    /// Drop a cached connection so the next `connect` re-establishes it.
    /// Intended for use after a connection-restored notification from the
    /// broker client.
    pub fn remove(&self, connection_string: &str) {
        self.connections.remove(connection_string);
    }

    /// Execute `op`, retrying on transient failures with a fixed backoff
    /// (jittered to avoid synchronized retry storms across Managers)
    /// up to `max_attempts` total attempts. Non-transient errors (per
    /// [`is_transient`]) propagate immediately; exhaustion propagates the
    /// last error.
    ///
    /// # Errors
    /// Propagates the last error from `op` if it is non-transient or if
    /// `max_attempts` is exhausted.
    pub async fn retry<T, F, Fut>(
        &self,
        mut op: F,
        backoff: Duration,
        max_attempts: u32,
    ) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !is_transient(&err) {
                        return Err(err);
                    }
                    if attempt >= max_attempts {
                        warn!(attempt, error = %err, "retry attempts exhausted");
                        return Err(err);
                    }
                    let sleep_for = jittered(backoff);
                    warn!(attempt, error = %err, delay = ?sleep_for, "transient error, retrying");
                    tokio::time::sleep(sleep_for).await;
                }
            }
        }
    }

    /// Report capabilities of the connected peer for `config`.
    ///
    /// # Errors
    /// Returns [`CacheError::NoConnectedServer`] if no endpoint could be
    /// probed, or [`CacheError::BackingStoreUnavailable`] if the
    /// connection itself could not be established.
    pub async fn features(&self, config: &ConnectionConfig) -> Result<FeatureSet, CacheError> {
        if let Some(version) = &config.strict_compatibility_version {
            return Ok(FeatureSet::for_version(version.clone()));
        }

        let broker = self.connect(config).await?;
        if broker.is_sharding_proxy() {
            return Ok(FeatureSet::conservative_default());
        }

        broker
            .server_version()
            .await
            .map(FeatureSet::for_version)
            .map_err(|_| CacheError::NoConnectedServer)
    }
}

/// Applies 50%-100% jitter to `base` so many Managers retrying the same
/// transient failure don't all wake up in lockstep.
fn jittered(base: Duration) -> Duration {
    let factor = 0.5 + rand::random::<f64>() * 0.5;
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

/// Redacts any `password=...` fragment up to the next `,` delimiter,
/// matching case-insensitively. Connection strings are otherwise passed
/// through unchanged.
#[must_use]
pub fn redact_credentials(connection_string: &str) -> String {
    let lower = connection_string.to_lowercase();
    let marker = "password=";
    let mut result = String::with_capacity(connection_string.len());
    let mut cursor = 0usize;

    while let Some(offset) = lower[cursor..].find(marker) {
        let marker_start = cursor + offset;
        let value_start = marker_start + marker.len();
        let value_end = connection_string[value_start..]
            .find(',')
            .map_or(connection_string.len(), |i| value_start + i);

        result.push_str(&connection_string[cursor..value_start]);
        result.push_str("***");
        cursor = value_end;
    }
    result.push_str(&connection_string[cursor..]);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBroker {
        healthy: bool,
        version: String,
        sharding_proxy: bool,
    }

    #[async_trait]
    impl Broker for FakeBroker {
        async fn publish(&self, _channel: &str, _payload: Bytes) -> anyhow::Result<()> {
            Ok(())
        }

        async fn subscribe(&self, _channel: &str) -> anyhow::Result<Box<dyn BrokerSubscription>> {
            anyhow::bail!("not used in these tests")
        }

        async fn is_healthy(&self) -> bool {
            self.healthy
        }

        async fn server_version(&self) -> anyhow::Result<String> {
            Ok(self.version.clone())
        }

        fn is_sharding_proxy(&self) -> bool {
            self.sharding_proxy
        }
    }

    fn dialer_counting(calls: Arc<AtomicUsize>) -> Dialer {
        Arc::new(move |_config| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, anyhow::Error>(Arc::new(FakeBroker {
                    healthy: true,
                    version: "7.2.0".to_string(),
                    sharding_proxy: false,
                }) as Arc<dyn Broker>)
            })
        })
    }

    #[tokio::test]
    async fn concurrent_connect_establishes_once_per_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let supervisor = Arc::new(ConnectionSupervisor::new(dialer_counting(calls.clone())));
        let config = ConnectionConfig::new("host=a,password=secret");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let supervisor = supervisor.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move { supervisor.connect(&config).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unhealthy_connection_surfaces_as_backing_store_unavailable() {
        let dialer: Dialer = Arc::new(|_config| {
            Box::pin(async move {
                Ok::<_, anyhow::Error>(Arc::new(FakeBroker {
                    healthy: false,
                    version: "7.2.0".to_string(),
                    sharding_proxy: false,
                }) as Arc<dyn Broker>)
            })
        });
        let supervisor = ConnectionSupervisor::new(dialer);
        let result = supervisor.connect(&ConnectionConfig::new("host=a")).await;
        assert!(matches!(result, Err(CacheError::BackingStoreUnavailable(_))));
    }

    #[tokio::test]
    async fn retry_stops_on_non_transient_error() {
        let supervisor = ConnectionSupervisor::new(dialer_counting(Arc::new(AtomicUsize::new(0))));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();

        let result: anyhow::Result<()> = supervisor
            .retry(
                move || {
                    attempts2.fetch_add(1, Ordering::SeqCst);
                    async { Err(anyhow::anyhow!("ERR unknown command 'FOO'")) }
                },
                Duration::from_millis(1),
                5,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "incompatible peer must not be retried");
    }

    #[tokio::test]
    async fn retry_exhausts_transient_error_after_max_attempts() {
        let supervisor = ConnectionSupervisor::new(dialer_counting(Arc::new(AtomicUsize::new(0))));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();

        let result: anyhow::Result<()> = supervisor
            .retry(
                move || {
                    attempts2.fetch_add(1, Ordering::SeqCst);
                    async { Err(anyhow::anyhow!("connection timed out")) }
                },
                Duration::from_millis(1),
                4,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let supervisor = ConnectionSupervisor::new(dialer_counting(Arc::new(AtomicUsize::new(0))));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();

        let result = supervisor
            .retry(
                move || {
                    let attempts = attempts2.clone();
                    async move {
                        let n = attempts.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            Err(anyhow::anyhow!("timed out"))
                        } else {
                            Ok(42)
                        }
                    }
                },
                Duration::from_millis(1),
                5,
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn strict_compatibility_mode_skips_probing() {
        let supervisor = ConnectionSupervisor::new(dialer_counting(Arc::new(AtomicUsize::new(0))));
        let config = ConnectionConfig::new("host=a").with_strict_compatibility("6.0.0");
        let features = supervisor.features(&config).await.unwrap();
        assert_eq!(features.server_version, "6.0.0");
        assert!(!features.conservative);
    }

    #[tokio::test]
    async fn sharding_proxy_returns_conservative_features() {
        let dialer: Dialer = Arc::new(|_config| {
            Box::pin(async move {
                Ok::<_, anyhow::Error>(Arc::new(FakeBroker {
                    healthy: true,
                    version: "7.2.0".to_string(),
                    sharding_proxy: true,
                }) as Arc<dyn Broker>)
            })
        });
        let supervisor = ConnectionSupervisor::new(dialer);
        let features = supervisor.features(&ConnectionConfig::new("host=a")).await.unwrap();
        assert!(features.conservative);
    }

    #[test]
    fn redacts_password_case_insensitively_up_to_comma() {
        let input = "host=localhost,PASSWORD=sup3r,port=6379";
        let redacted = redact_credentials(input);
        assert_eq!(redacted, "host=localhost,PASSWORD=***,port=6379");
    }

    #[test]
    fn leaves_connection_strings_without_password_untouched() {
        let input = "host=localhost,port=6379";
        assert_eq!(redact_credentials(input), input);
    }
}
