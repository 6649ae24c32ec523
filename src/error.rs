//! Error types for swr-kit.
//!
//! Fetch failures are not represented here: they belong to the caller's own
//! error type and surface through [`Query::error`](crate::Query::error) or the
//! `Err` returned by [`Request::run`](crate::Request::run).

use thiserror::Error;

/// Errors raised by the crate itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Configuration value is invalid or could not be parsed.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Operation needs a tokio runtime but was called outside of one.
    #[error("no tokio runtime available: {0}")]
    RuntimeUnavailable(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn runtime(err: tokio::runtime::TryCurrentError) -> Self {
        Error::RuntimeUnavailable(err.to_string())
    }
}
