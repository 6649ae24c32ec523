//! # swr-kit
//!
//! Stale-while-revalidate query cache for async Rust.
//!
//! ## Features
//!
//! - **Shared entries:** Many consumers subscribe to the same key and see the same data
//! - **Stale-while-revalidate:** Cached data is served immediately while a refresh runs
//! - **Request deduplication:** At most one fetch per key is in flight at any time
//! - **Race-safe requests:** [`Request`] discards results of superseded or cancelled runs
//! - **Isolated caches:** Every [`QueryCache`] is an explicit context, no hidden globals
//!
//! ## Quick Start
//!
//! ```ignore
//! use swr_kit::{IsEmpty, QueryCache, QueryOptions};
//! use std::time::Duration;
//!
//! // 1. Define your data
//! #[derive(Clone, Debug)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! // 2. Implement IsEmpty (the default says "never empty")
//! impl IsEmpty for User {}
//!
//! // 3. Create a cache - clones share the same entries
//! let cache: QueryCache<User, String> = QueryCache::new();
//!
//! // 4. Subscribe
//! let query = cache.subscribe(
//!     "user:1",
//!     || async { fetch_user(1).await },
//!     QueryOptions::new().with_deduping_interval(Duration::from_secs(5)),
//! )?;
//!
//! // A second subscriber to "user:1" shares the fetch and its result.
//! let other = cache.subscribe("user:1", || async { fetch_user(1).await }, QueryOptions::new())?;
//! ```

#[macro_use]
extern crate log;

pub mod cache;
pub mod config;
pub mod empty;
pub mod entry;
pub mod error;
pub mod observability;
pub mod query;
pub mod request;
pub mod signal;

// Re-exports for convenience
pub use cache::{QueryCache, QueryData, QueryError};
pub use config::QueryConfig;
pub use empty::{is_data_empty, IsEmpty};
pub use entry::{Broadcast, EntrySnapshot, ListenerId};
pub use error::{Error, Result};
pub use observability::{NoOpMetrics, QueryMetrics};
pub use query::{KeySource, Query, QueryOptions, QueryState};
pub use request::{Request, RequestOptions};
pub use signal::{Signal, SignalSubscription};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
