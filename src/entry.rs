//! Per-key cache entry: cached payload, fetch status and subscriber registry.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Stable identifier of one subscriber, unique within a [`QueryCache`](crate::QueryCache).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub(crate) u64);

/// State change pushed to every listener of an entry.
///
/// `validating == true` announces a fetch start and carries no data or
/// error. `validating == false` carries the settled outcome: `data` on
/// success, `error` on failure.
#[derive(Clone, Debug, PartialEq)]
pub struct Broadcast<D, E> {
    pub error: Option<E>,
    pub validating: bool,
    pub data: Option<D>,
    /// Entry version this broadcast describes.
    pub version: u64,
}

impl<D, E> Broadcast<D, E> {
    pub(crate) fn started(version: u64) -> Self {
        Broadcast {
            error: None,
            validating: true,
            data: None,
            version,
        }
    }

    pub(crate) fn succeeded(data: D, version: u64) -> Self {
        Broadcast {
            error: None,
            validating: false,
            data: Some(data),
            version,
        }
    }

    pub(crate) fn failed(error: E, version: u64) -> Self {
        Broadcast {
            error: Some(error),
            validating: false,
            data: None,
            version,
        }
    }
}

pub(crate) type Listener<D, E> = Arc<dyn Fn(&Broadcast<D, E>) + Send + Sync>;

/// A broadcast together with the listeners registered when it was produced.
pub(crate) type Notification<D, E> = (Broadcast<D, E>, Vec<Listener<D, E>>);

/// Point-in-time copy of an entry, without its listeners.
#[derive(Clone, Debug, PartialEq)]
pub struct EntrySnapshot<D, E> {
    pub data: Option<D>,
    pub error: Option<E>,
    pub is_validating: bool,
    /// Time of the last successful fetch; `None` if it never succeeded.
    pub created_at: Option<Instant>,
    pub listener_count: usize,
    /// Advances on every change pushed to listeners.
    pub version: u64,
}

struct EntryState<D, E> {
    data: Option<D>,
    error: Option<E>,
    is_validating: bool,
    created_at: Option<Instant>,
    version: u64,
    listeners: BTreeMap<ListenerId, Listener<D, E>>,
}

/// Cache entry for one key.
///
/// Entries are created on first subscription and live as long as their
/// cache. `is_validating` is the only guard against concurrent fetches.
pub struct CacheEntry<D, E> {
    state: Mutex<EntryState<D, E>>,
}

impl<D, E> EntryState<D, E> {
    fn listeners(&self) -> Vec<Listener<D, E>> {
        self.listeners.values().cloned().collect()
    }
}

impl<D, E> Default for CacheEntry<D, E> {
    fn default() -> Self {
        CacheEntry {
            state: Mutex::new(EntryState {
                data: None,
                error: None,
                is_validating: false,
                created_at: None,
                version: 0,
                listeners: BTreeMap::new(),
            }),
        }
    }
}

impl<D: Clone, E: Clone> CacheEntry<D, E> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> EntrySnapshot<D, E> {
        let state = self.state.lock();
        EntrySnapshot {
            data: state.data.clone(),
            error: state.error.clone(),
            is_validating: state.is_validating,
            created_at: state.created_at,
            listener_count: state.listeners.len(),
            version: state.version,
        }
    }

    pub(crate) fn add_listener(&self, id: ListenerId, listener: Listener<D, E>) {
        self.state.lock().listeners.insert(id, listener);
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        self.state.lock().listeners.remove(&id).is_some()
    }

    /// Claim the fetch slot. Returns the start broadcast and the listeners
    /// to notify, or `None` if a fetch is already in flight.
    pub(crate) fn begin_validation(&self) -> Option<Notification<D, E>> {
        let mut state = self.state.lock();
        if state.is_validating {
            return None;
        }
        state.is_validating = true;
        state.version += 1;
        Some((Broadcast::started(state.version), state.listeners()))
    }

    /// Store a successful result. `created_at` moves only here.
    pub(crate) fn settle_success(&self, data: D, now: Instant) -> Notification<D, E> {
        let mut state = self.state.lock();
        state.data = Some(data.clone());
        state.error = None;
        state.created_at = Some(now);
        state.version += 1;
        (Broadcast::succeeded(data, state.version), state.listeners())
    }

    /// Store a failure; the cached data is dropped.
    pub(crate) fn settle_failure(&self, error: E) -> Notification<D, E> {
        let mut state = self.state.lock();
        state.data = None;
        state.error = Some(error.clone());
        state.version += 1;
        (Broadcast::failed(error, state.version), state.listeners())
    }

    /// Re-announce the current data and error, for settling a fetch that
    /// produced no outcome.
    pub(crate) fn replay_outcome(&self) -> Notification<D, E> {
        let mut state = self.state.lock();
        state.version += 1;
        let broadcast = Broadcast {
            error: state.error.clone(),
            validating: false,
            data: state.data.clone(),
            version: state.version,
        };
        (broadcast, state.listeners())
    }

    pub(crate) fn end_validation(&self) {
        self.state.lock().is_validating = false;
    }
}

impl<D, E> fmt::Debug for CacheEntry<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheEntry")
            .field("is_validating", &state.is_validating)
            .field("created_at", &state.created_at)
            .field("has_data", &state.data.is_some())
            .field("has_error", &state.error.is_some())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

/// Invoke each listener in registration order. Called with no locks held.
pub(crate) fn notify<D, E>(listeners: &[Listener<D, E>], broadcast: &Broadcast<D, E>) {
    for listener in listeners {
        listener(broadcast);
    }
}
