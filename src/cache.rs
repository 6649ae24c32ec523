//! Query cache - the shared entry store behind every [`Query`].

use crate::config::QueryConfig;
use crate::empty::IsEmpty;
use crate::entry::{notify, CacheEntry, EntrySnapshot, ListenerId};
use crate::error::Result;
use crate::observability::{NoOpMetrics, QueryMetrics};
use crate::query::{KeySource, Query, QueryOptions};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use std::fmt::{self, Debug};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::Instant;

/// Data that can be cached and shared between subscribers.
pub trait QueryData: IsEmpty + Clone + Send + Sync + 'static {}

impl<T: IsEmpty + Clone + Send + Sync + 'static> QueryData for T {}

/// Error type produced by fetchers.
pub trait QueryError: Clone + Debug + Send + Sync + 'static {}

impl<T: Clone + Debug + Send + Sync + 'static> QueryError for T {}

pub(crate) type Fetcher<D, E> =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<D, E>> + Send + Sync>;

/// Keyed store of cache entries shared by all queries created from it.
///
/// Cloning is cheap: clones share the same entries, config and metrics.
/// Separate `QueryCache` values are fully isolated from each other.
/// Entries are never evicted.
///
/// # Example
///
/// ```ignore
/// use swr_kit::{QueryCache, QueryOptions};
///
/// let cache: QueryCache<String, String> = QueryCache::new();
/// let query = cache.subscribe("greeting", || async { Ok("hello".to_string()) }, QueryOptions::default())?;
///
/// // later, once the fetch settled
/// assert_eq!(query.data().as_deref(), Some("hello"));
/// ```
pub struct QueryCache<D, E> {
    entries: Arc<DashMap<String, Arc<CacheEntry<D, E>>>>,
    config: QueryConfig,
    metrics: Arc<dyn QueryMetrics>,
    next_listener: Arc<AtomicU64>,
}

impl<D, E> Clone for QueryCache<D, E> {
    fn clone(&self) -> Self {
        QueryCache {
            entries: Arc::clone(&self.entries),
            config: self.config.clone(),
            metrics: Arc::clone(&self.metrics),
            next_listener: Arc::clone(&self.next_listener),
        }
    }
}

impl<D: QueryData, E: QueryError> Default for QueryCache<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: QueryData, E: QueryError> QueryCache<D, E> {
    /// Create an empty cache with default config.
    pub fn new() -> Self {
        QueryCache {
            entries: Arc::new(DashMap::new()),
            config: QueryConfig::default(),
            metrics: Arc::new(NoOpMetrics),
            next_listener: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create an empty cache configured from `SWR_KIT_*` environment variables.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if a variable is malformed.
    pub fn from_env() -> Result<Self> {
        let config = QueryConfig::from_env()?;
        Ok(Self::new().with_config(config))
    }

    /// Set the defaults used by subscriptions that don't override them.
    pub fn with_config(mut self, config: QueryConfig) -> Self {
        if config.expires_before_revalidation() {
            warn!(
                "Query cache ttl ({:?}) is shorter than its deduping interval ({:?})",
                config.ttl, config.deduping_interval
            );
        }
        info!(
            "✓ Query cache configured (ttl: {:?}, deduping interval: {:?})",
            config.ttl, config.deduping_interval
        );
        self.config = config;
        self
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Arc<dyn QueryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Subscribe a consumer to `key`, fetching with `fetcher` when needed.
    ///
    /// Cached data that is still valid is copied into the returned [`Query`]
    /// before this returns. Empty or stale-enough data triggers a background
    /// fetch on the current tokio runtime; at most one fetch per key is ever
    /// in flight, and its outcome reaches every subscriber of the key.
    ///
    /// # Errors
    /// Returns `Error::RuntimeUnavailable` when called outside a tokio runtime.
    pub fn subscribe<K, F, Fut>(
        &self,
        key: K,
        fetcher: F,
        options: QueryOptions<D>,
    ) -> Result<Query<D, E>>
    where
        K: Into<KeySource>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<D, E>> + Send + 'static,
    {
        let fetcher: Fetcher<D, E> = Arc::new(move || fetcher().boxed());
        Query::new(self.clone(), key.into(), fetcher, options)
    }

    /// Number of keys ever subscribed to.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Copy of the entry for `key`, if one was ever created.
    pub fn snapshot(&self, key: &str) -> Option<EntrySnapshot<D, E>> {
        self.entries.get(key).map(|entry| entry.value().snapshot())
    }

    pub(crate) fn metrics(&self) -> &dyn QueryMetrics {
        self.metrics.as_ref()
    }

    pub(crate) fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    /// Entry for `key`, created on first use.
    pub(crate) fn entry(&self, key: &str) -> Arc<CacheEntry<D, E>> {
        if let Some(entry) = self.entries.get(key) {
            return Arc::clone(entry.value());
        }
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| {
            debug!("Creating cache entry for {}", key);
            Arc::new(CacheEntry::new())
        });
        Arc::clone(entry.value())
    }

    pub(crate) fn remove_listener(&self, key: &str, id: ListenerId) {
        if let Some(entry) = self.entries.get(key) {
            entry.value().remove_listener(id);
        }
    }

    /// Fetch `key` in the background unless a fetch is already in flight.
    ///
    /// The fetcher is invoked before this returns; its future is driven on
    /// `runtime`. Every listener hears the start, then the outcome. Failures
    /// stay inside the entry and are never returned.
    pub(crate) fn revalidate(
        &self,
        key: &str,
        entry: &Arc<CacheEntry<D, E>>,
        fetcher: &Fetcher<D, E>,
        runtime: &Handle,
    ) {
        let Some((started_broadcast, listeners)) = entry.begin_validation() else {
            debug!("Fetch already in flight for {}, skipping", key);
            self.metrics.record_deduplicated(key);
            return;
        };

        debug!("» Revalidating {} ({} listeners)", key, listeners.len());
        notify(&listeners, &started_broadcast);

        let call = match std::panic::catch_unwind(AssertUnwindSafe(|| fetcher())) {
            Ok(call) => call,
            Err(panic) => {
                settle_panicked(key, entry, self.metrics.as_ref());
                std::panic::resume_unwind(panic);
            }
        };

        let key = key.to_string();
        let entry = Arc::clone(entry);
        let metrics = Arc::clone(&self.metrics);
        let started = Instant::now();

        runtime.spawn(async move {
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(data)) => {
                    let (broadcast, listeners) = entry.settle_success(data, Instant::now());
                    metrics.record_fetch(&key, started.elapsed());
                    debug!("✓ Fetched {} in {:?}", key, started.elapsed());
                    notify(&listeners, &broadcast);
                    entry.end_validation();
                }
                Ok(Err(err)) => {
                    debug!("✗ Fetch failed for {}: {:?}", key, err);
                    metrics.record_error(&key, &format!("{:?}", err));
                    let (broadcast, listeners) = entry.settle_failure(err);
                    notify(&listeners, &broadcast);
                    entry.end_validation();
                }
                Err(_) => settle_panicked(&key, &entry, metrics.as_ref()),
            }
        });
    }
}

/// Release the fetch slot after a panicking fetcher, replaying the entry's
/// previous outcome so subscribers leave the validating state.
fn settle_panicked<D: QueryData, E: QueryError>(
    key: &str,
    entry: &CacheEntry<D, E>,
    metrics: &dyn QueryMetrics,
) {
    error!("Fetcher panicked for {}", key);
    metrics.record_error(key, "fetcher panicked");
    let (broadcast, listeners) = entry.replay_outcome();
    notify(&listeners, &broadcast);
    entry.end_validation();
}

impl<D, E> Debug for QueryCache<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .finish()
    }
}
