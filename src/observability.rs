//! Metrics hooks for cache decisions and fetch outcomes.

use std::time::Duration;

/// Receives cache events from a [`QueryCache`](crate::QueryCache).
///
/// Every method has a no-op default, so implementors only override what they
/// export. Methods are called synchronously on the thread that made the
/// decision; keep them cheap.
pub trait QueryMetrics: Send + Sync {
    /// A subscriber was served valid cached data on bind.
    fn record_hit(&self, _key: &str) {}

    /// A subscriber bound to a key with no valid cached data.
    fn record_miss(&self, _key: &str) {}

    /// A fetch settled successfully after `duration`.
    fn record_fetch(&self, _key: &str, _duration: Duration) {}

    /// A fetch failed (or panicked).
    fn record_error(&self, _key: &str, _error: &str) {}

    /// A fetch request was dropped because one was already in flight.
    fn record_deduplicated(&self, _key: &str) {}
}

/// Default metrics sink.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpMetrics;

impl QueryMetrics for NoOpMetrics {}
