//! Minimal observable value with synchronous change notification.
//!
//! Query keys and request readiness are driven by a [`Signal`]: the
//! controllers observe the current value once, then react to every change
//! pushed by [`Signal::set`].

use parking_lot::{Mutex, ReentrantMutex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Observer<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

struct SignalInner<T> {
    value: Mutex<T>,
    /// Held across a change and its notification, so observers see changes
    /// in the order they were written. Re-entrant for observers that set.
    notifying: ReentrantMutex<()>,
    observers: Mutex<BTreeMap<u64, Observer<T>>>,
    next_id: AtomicU64,
    /// Keeps a derived signal attached to its source.
    upstream: Mutex<Option<SignalSubscription>>,
}

/// Shared observable value.
///
/// Cloning a `Signal` yields another handle to the same value. Observers are
/// called synchronously, in subscription order, on the thread that changed the
/// value, and only when the new value differs from the old one. Changes made
/// from several threads are applied and delivered one at a time.
///
/// # Example
///
/// ```
/// use swr_kit::Signal;
///
/// let user_id = Signal::new(None::<u64>);
/// let key = user_id.map(|id| id.map(|id| format!("user:{id}")));
///
/// user_id.set(Some(7));
/// assert_eq!(key.get().as_deref(), Some("user:7"));
/// ```
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("value", &*self.inner.value.lock())
            .finish()
    }
}

impl<T: Default + Clone + PartialEq + Send + 'static> Default for Signal<T> {
    fn default() -> Self {
        Signal::new(T::default())
    }
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    pub fn new(value: T) -> Self {
        Signal {
            inner: Arc::new(SignalInner {
                value: Mutex::new(value),
                notifying: ReentrantMutex::new(()),
                observers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(0),
                upstream: Mutex::new(None),
            }),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.inner.value.lock().clone()
    }

    /// Replace the value, notifying observers if it changed.
    pub fn set(&self, value: T) {
        self.update(|current| *current = value);
    }

    /// Modify the value in place, notifying observers if it changed.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let _notifying = self.inner.notifying.lock();
        let changed = {
            let mut guard = self.inner.value.lock();
            let old = guard.clone();
            f(&mut guard);
            if *guard == old {
                None
            } else {
                Some((guard.clone(), old))
            }
        };

        if let Some((new, old)) = changed {
            // Snapshot so observers may subscribe or unsubscribe re-entrantly.
            let observers: Vec<Observer<T>> =
                self.inner.observers.lock().values().cloned().collect();
            for observer in observers {
                observer(&new, &old);
            }
        }
    }

    /// Register `observer`, called with `(new, old)` after every change.
    ///
    /// The observer stays registered until the returned subscription is
    /// dropped or [`SignalSubscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, observer: F) -> SignalSubscription
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.lock().insert(id, Arc::new(observer));

        let weak: Weak<SignalInner<T>> = Arc::downgrade(&self.inner);
        SignalSubscription {
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.observers.lock().remove(&id);
                }
            })),
        }
    }

    /// Register `observer` and call it right away with the current value as
    /// both `new` and `old`.
    ///
    /// No change can land between the first call and the registration: every
    /// value written afterwards reaches the observer exactly once.
    pub fn observe<F>(&self, observer: F) -> SignalSubscription
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let _notifying = self.inner.notifying.lock();
        let observer: Observer<T> = Arc::new(observer);
        let relay = Arc::clone(&observer);
        let subscription = self.subscribe(move |new, old| relay(new, old));

        let current = self.get();
        observer(&current, &current);
        subscription
    }

    /// Derive a signal that recomputes `f` whenever this one changes.
    ///
    /// The derived signal holds the subscription to its source, so it keeps
    /// tracking as long as any handle to it is alive.
    pub fn map<U, F>(&self, f: F) -> Signal<U>
    where
        U: Clone + PartialEq + Send + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let derived = Signal::new(f(&self.get()));
        let target = Arc::downgrade(&derived.inner);

        let subscription = self.observe(move |new, _| {
            if let Some(inner) = target.upgrade() {
                Signal { inner }.set(f(new));
            }
        });
        *derived.inner.upstream.lock() = Some(subscription);

        derived
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }
}

/// Registration handle returned by [`Signal::subscribe`].
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct SignalSubscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SignalSubscription {
    /// Stop receiving notifications. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl fmt::Debug for SignalSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSubscription")
            .field("active", &self.detach.is_some())
            .finish()
    }
}
