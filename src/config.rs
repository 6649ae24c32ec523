//! Cache-wide defaults for freshness and deduplication windows.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default deduplication window: a cached entry younger than this is served
/// without a background revalidation.
pub const DEFAULT_DEDUPING_INTERVAL: Duration = Duration::from_millis(2000);

/// Environment override for [`QueryConfig::ttl`], in milliseconds.
pub const TTL_ENV: &str = "SWR_KIT_TTL_MS";

/// Environment override for [`QueryConfig::deduping_interval`], in milliseconds.
pub const DEDUPING_INTERVAL_ENV: &str = "SWR_KIT_DEDUPING_INTERVAL_MS";

/// Defaults applied to every subscription that does not override them.
///
/// A zero `ttl` means cached data never expires. A zero `deduping_interval`
/// disables background revalidation of non-empty cached data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub ttl: Duration,
    pub deduping_interval: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            ttl: Duration::ZERO,
            deduping_interval: DEFAULT_DEDUPING_INTERVAL,
        }
    }
}

impl QueryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache validity window.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the deduplication window.
    pub fn with_deduping_interval(mut self, interval: Duration) -> Self {
        self.deduping_interval = interval;
        self
    }

    /// Build a config from defaults overridden by environment variables.
    ///
    /// Reads `SWR_KIT_TTL_MS` and `SWR_KIT_DEDUPING_INTERVAL_MS`. Unset
    /// variables keep their defaults.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if a variable is set but is not a
    /// non-negative integer.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(ttl) = read_millis(TTL_ENV)? {
            config.ttl = ttl;
        }
        if let Some(interval) = read_millis(DEDUPING_INTERVAL_ENV)? {
            config.deduping_interval = interval;
        }

        debug!("Loaded query config from environment: {:?}", config);
        Ok(config)
    }

    /// `true` when a non-zero `ttl` is shorter than a non-zero
    /// `deduping_interval`, so cached data expires before a background
    /// revalidation is due. Allowed, but usually unintended.
    pub fn expires_before_revalidation(&self) -> bool {
        !self.ttl.is_zero()
            && !self.deduping_interval.is_zero()
            && self.ttl < self.deduping_interval
    }
}

fn read_millis(var: &str) -> Result<Option<Duration>> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| Error::ConfigError(format!("{var}={raw:?} is not valid: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::ConfigError(format!("{var}: {e}"))),
    }
}
