//! Query controller - binds one consumer to a key of a [`QueryCache`].

use crate::cache::{Fetcher, QueryCache, QueryData, QueryError};
use crate::empty::is_data_empty;
use crate::entry::{Broadcast, CacheEntry, Listener, ListenerId};
use crate::error::{Error, Result};
use crate::signal::{Signal, SignalSubscription};
use parking_lot::{Mutex, ReentrantMutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;

type UpdateCallback<D> = Arc<dyn Fn(&D) + Send + Sync>;

/// Where a query takes its key from.
///
/// An absent key (`None` or the empty string) leaves the query inactive: no
/// entry is created and nothing is fetched.
#[derive(Clone, Debug)]
pub enum KeySource {
    /// Key fixed for the lifetime of the query.
    Static(Option<String>),
    /// Key that follows a signal; every change rebinds the query.
    Signal(Signal<Option<String>>),
}

impl KeySource {
    fn normalize(key: Option<String>) -> Option<String> {
        key.filter(|key| !key.is_empty())
    }
}

impl From<&str> for KeySource {
    fn from(key: &str) -> Self {
        KeySource::Static(Some(key.to_string()))
    }
}

impl From<String> for KeySource {
    fn from(key: String) -> Self {
        KeySource::Static(Some(key))
    }
}

impl From<Option<String>> for KeySource {
    fn from(key: Option<String>) -> Self {
        KeySource::Static(key)
    }
}

impl From<Option<&str>> for KeySource {
    fn from(key: Option<&str>) -> Self {
        KeySource::Static(key.map(str::to_string))
    }
}

impl From<Signal<Option<String>>> for KeySource {
    fn from(signal: Signal<Option<String>>) -> Self {
        KeySource::Signal(signal)
    }
}

impl From<&Signal<Option<String>>> for KeySource {
    fn from(signal: &Signal<Option<String>>) -> Self {
        KeySource::Signal(signal.clone())
    }
}

/// Per-subscription settings.
///
/// Unset windows fall back to the cache's [`QueryConfig`](crate::QueryConfig).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use swr_kit::QueryOptions;
///
/// let options = QueryOptions::<Vec<String>>::new()
///     .with_ttl(Duration::from_secs(30))
///     .with_deduping_interval(Duration::from_secs(1))
///     .with_initial_value(Vec::new())
///     .on_update(|items| println!("{} items", items.len()));
/// ```
pub struct QueryOptions<D> {
    ttl: Option<Duration>,
    deduping_interval: Option<Duration>,
    initial_value: Option<D>,
    on_update: Option<UpdateCallback<D>>,
}

impl<D> Default for QueryOptions<D> {
    fn default() -> Self {
        QueryOptions {
            ttl: None,
            deduping_interval: None,
            initial_value: None,
            on_update: None,
        }
    }
}

impl<D> QueryOptions<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long cached data stays valid for new subscribers. Zero means forever.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Minimum age of cached data before a new subscriber revalidates it.
    /// Zero disables background revalidation of non-empty data.
    pub fn with_deduping_interval(mut self, interval: Duration) -> Self {
        self.deduping_interval = Some(interval);
        self
    }

    /// Local value shown before the first fetch and after a failed one.
    ///
    /// Only affects this query; it is never written to the cache.
    pub fn with_initial_value(mut self, value: D) -> Self {
        self.initial_value = Some(value);
        self
    }

    /// Called with every non-empty value this query receives, including
    /// cached data served on bind.
    pub fn on_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(&D) + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(callback));
        self
    }
}

impl<D> fmt::Debug for QueryOptions<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("ttl", &self.ttl)
            .field("deduping_interval", &self.deduping_interval)
            .field("has_initial_value", &self.initial_value.is_some())
            .field("has_on_update", &self.on_update.is_some())
            .finish()
    }
}

/// Consumer-visible state of a query.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryState<D, E> {
    pub key: Option<String>,
    pub data: Option<D>,
    pub error: Option<E>,
    pub is_validating: bool,
    /// Validating with nothing usable to show yet.
    pub is_loading: bool,
}

struct LocalState<D, E> {
    key: Option<String>,
    /// Advances on every rebind and on dispose. Listeners registered under an
    /// older epoch are ignored.
    epoch: u64,
    /// Newest entry version folded into this view under the current epoch.
    seen_version: u64,
    disposed: bool,
    data: Option<D>,
    error: Option<E>,
    is_validating: bool,
}

struct QueryInner<D, E> {
    cache: QueryCache<D, E>,
    fetcher: Fetcher<D, E>,
    runtime: Handle,
    id: ListenerId,
    ttl: Duration,
    deduping_interval: Duration,
    initial_value: Option<D>,
    on_update: Option<UpdateCallback<D>>,
    state: Mutex<LocalState<D, E>>,
    /// Serializes rebinds and dispose. Re-entrant so an `on_update` callback
    /// may change the key signal.
    binding: ReentrantMutex<()>,
    key_watch: Mutex<Option<SignalSubscription>>,
}

/// One consumer's view of a cached key.
///
/// Created by [`QueryCache::subscribe`]. Dropping the query (or calling
/// [`Query::dispose`]) detaches it from its entry; the entry itself stays
/// cached.
pub struct Query<D: QueryData, E: QueryError> {
    inner: Arc<QueryInner<D, E>>,
}

impl<D: QueryData, E: QueryError> Query<D, E> {
    pub(crate) fn new(
        cache: QueryCache<D, E>,
        key: KeySource,
        fetcher: Fetcher<D, E>,
        options: QueryOptions<D>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(Error::runtime)?;
        let config = cache.config().clone();
        let id = cache.next_listener_id();

        let inner = Arc::new(QueryInner {
            id,
            fetcher,
            runtime,
            ttl: options.ttl.unwrap_or(config.ttl),
            deduping_interval: options
                .deduping_interval
                .unwrap_or(config.deduping_interval),
            state: Mutex::new(LocalState {
                key: None,
                epoch: 0,
                seen_version: 0,
                disposed: false,
                data: options.initial_value.clone(),
                error: None,
                is_validating: false,
            }),
            initial_value: options.initial_value,
            on_update: options.on_update,
            binding: ReentrantMutex::new(()),
            key_watch: Mutex::new(None),
            cache,
        });

        match key {
            KeySource::Static(key) => inner.bind(KeySource::normalize(key)),
            KeySource::Signal(signal) => {
                let weak = Arc::downgrade(&inner);
                let watch = signal.observe(move |new_key, _| {
                    if let Some(inner) = weak.upgrade() {
                        inner.bind(KeySource::normalize(new_key.clone()));
                    }
                });
                *inner.key_watch.lock() = Some(watch);
            }
        }

        Ok(Query { inner })
    }

    /// Identifier of this query's listener within its cache.
    pub fn id(&self) -> ListenerId {
        self.inner.id
    }

    /// Key the query is currently bound to.
    pub fn key(&self) -> Option<String> {
        self.inner.state.lock().key.clone()
    }

    pub fn data(&self) -> Option<D> {
        self.inner.state.lock().data.clone()
    }

    pub fn error(&self) -> Option<E> {
        self.inner.state.lock().error.clone()
    }

    pub fn is_validating(&self) -> bool {
        self.inner.state.lock().is_validating
    }

    /// `true` while a fetch runs and there is no usable data yet. Background
    /// revalidation of cached data does not count as loading.
    pub fn is_loading(&self) -> bool {
        let state = self.inner.state.lock();
        state.is_validating && is_data_empty(state.data.as_ref())
    }

    /// Consistent copy of all consumer-visible fields.
    pub fn state(&self) -> QueryState<D, E> {
        let state = self.inner.state.lock();
        QueryState {
            key: state.key.clone(),
            data: state.data.clone(),
            error: state.error.clone(),
            is_validating: state.is_validating,
            is_loading: state.is_validating && is_data_empty(state.data.as_ref()),
        }
    }

    /// Fetch the current key now, unless a fetch for it is already in flight.
    pub fn refresh(&self) {
        self.inner.refresh();
    }

    /// Detach from the cache. Later broadcasts no longer reach this query.
    ///
    /// Idempotent; also runs on drop.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl<D: QueryData, E: QueryError> Drop for Query<D, E> {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl<D: QueryData, E: QueryError> fmt::Debug for Query<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Query")
            .field("id", &self.inner.id)
            .field("key", &state.key)
            .field("is_validating", &state.is_validating)
            .field("has_data", &state.data.is_some())
            .field("has_error", &state.error.is_some())
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl<D: QueryData, E: QueryError> QueryInner<D, E> {
    /// Move this query to `key`: detach from the old entry, attach to the
    /// new one, then apply the freshness rules.
    fn bind(self: &Arc<Self>, key: Option<String>) {
        let _binding = self.binding.lock();

        let (old_key, epoch) = {
            let mut state = self.state.lock();
            if state.disposed || (state.epoch > 0 && state.key == key) {
                return;
            }
            state.epoch += 1;
            state.seen_version = 0;
            (std::mem::replace(&mut state.key, key.clone()), state.epoch)
        };

        if let Some(old_key) = old_key {
            debug!("Query {:?} leaving {}", self.id, old_key);
            self.cache.remove_listener(&old_key, self.id);
        }

        let Some(key) = key else {
            debug!("Query {:?} has no key, staying idle", self.id);
            return;
        };

        let entry = self.cache.entry(&key);
        entry.add_listener(self.id, self.listener(epoch));
        self.load(&key, &entry, epoch);
    }

    /// Serve cached data if still valid, then decide whether to fetch.
    fn load(&self, key: &str, entry: &Arc<CacheEntry<D, E>>, epoch: u64) {
        let cached = entry.snapshot();
        let passed = cached
            .created_at
            .map(|created_at| Instant::now().saturating_duration_since(created_at));

        let is_cache_valid = passed.is_some_and(|passed| self.ttl.is_zero() || passed <= self.ttl);
        let is_over_dedupe = !self.deduping_interval.is_zero()
            && passed.map_or(true, |passed| passed > self.deduping_interval);

        if is_cache_valid {
            debug!("✓ Serving cached {} to query {:?}", key, self.id);
            self.cache.metrics().record_hit(key);

            let served = {
                let mut state = self.state.lock();
                if state.epoch != epoch {
                    return;
                }
                // a broadcast newer than this read already reached us
                if state.seen_version > cached.version {
                    None
                } else {
                    state.seen_version = cached.version;
                    state.data = cached.data.clone();
                    state.error = cached.error.clone();
                    state.is_validating = cached.is_validating;
                    state.data.clone()
                }
            };
            self.safe_update(served.as_ref());
        } else {
            debug!("✗ No valid cache for {} (query {:?})", key, self.id);
            self.cache.metrics().record_miss(key);
        }

        if is_data_empty(cached.data.as_ref()) || is_over_dedupe {
            self.cache.revalidate(key, entry, &self.fetcher, &self.runtime);
        }
    }

    fn listener(self: &Arc<Self>, epoch: u64) -> Listener<D, E> {
        let weak = Arc::downgrade(self);
        Arc::new(move |broadcast: &Broadcast<D, E>| {
            if let Some(inner) = weak.upgrade() {
                inner.apply(epoch, broadcast);
            }
        })
    }

    /// Fold one broadcast into the local view.
    fn apply(&self, epoch: u64, broadcast: &Broadcast<D, E>) {
        {
            let mut state = self.state.lock();
            if state.disposed || state.epoch != epoch || broadcast.version < state.seen_version {
                return;
            }
            state.seen_version = broadcast.version;
            state.error = broadcast.error.clone();
            state.is_validating = broadcast.validating;

            if !broadcast.validating {
                state.data = match (&broadcast.error, &self.initial_value) {
                    (Some(_), Some(initial)) => Some(initial.clone()),
                    _ => broadcast.data.clone(),
                };
            }
        }
        self.safe_update(broadcast.data.as_ref());
    }

    fn safe_update(&self, data: Option<&D>) {
        if let (Some(data), Some(on_update)) = (data, &self.on_update) {
            if !is_data_empty(Some(data)) {
                on_update(data);
            }
        }
    }

    fn refresh(&self) {
        let key = {
            let state = self.state.lock();
            if state.disposed {
                return;
            }
            state.key.clone()
        };

        if let Some(key) = key {
            let entry = self.cache.entry(&key);
            self.cache.revalidate(&key, &entry, &self.fetcher, &self.runtime);
        }
    }

    fn dispose(&self) {
        let _binding = self.binding.lock();

        let key = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.epoch += 1;
            state.key.clone()
        };

        let watch = self.key_watch.lock().take();
        drop(watch);

        if let Some(key) = key {
            debug!("Query {:?} disposed, leaving {}", self.id, key);
            self.cache.remove_listener(&key, self.id);
        }
    }
}
