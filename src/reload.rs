//! Background tasks: limit configuration hot reload and idle counter sweeping.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::admission::RequestLimit;
use crate::error::Result;
use crate::ratelimit::{LimitConfig, ReloadableRateLimiter};

/// Re-reads the limit configuration file and applies changes to both limiters.
#[derive(Debug)]
pub struct PolicyWatcher {
    path: PathBuf,
    current: LimitConfig,
    rate_limiter: Arc<ReloadableRateLimiter>,
    request_limit: RequestLimit,
}

impl PolicyWatcher {
    /// `current` is the configuration the limiters were built from.
    pub fn new(
        path: impl Into<PathBuf>,
        current: LimitConfig,
        rate_limiter: Arc<ReloadableRateLimiter>,
        request_limit: RequestLimit,
    ) -> Self {
        Self {
            path: path.into(),
            current,
            rate_limiter,
            request_limit,
        }
    }

    /// Reload if the file changed. Returns whether a new configuration was applied.
    ///
    /// An unreadable or invalid file leaves both limiters as they were.
    pub fn poll(&mut self) -> Result<bool> {
        let config = LimitConfig::from_file(&self.path)?;
        if config == self.current {
            debug!(path = %self.path.display(), "Rate limit configuration unchanged");
            return Ok(false);
        }

        let policy = config.validate()?;
        self.rate_limiter.reload(&config)?;
        self.request_limit.reconfigure(&policy);
        self.current = config;
        Ok(true)
    }

    /// Poll every `interval` until the task is dropped. A zero interval
    /// disables reloading.
    pub async fn run(mut self, interval: Duration) {
        if interval.is_zero() {
            info!("Rate limit configuration reload disabled");
            return;
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = self.poll() {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to reload rate limit configuration, keeping previous"
                );
            }
        }
    }
}

/// Periodically drop counters that no longer hold live requests.
pub async fn sweep_counters(rate_limiter: Arc<ReloadableRateLimiter>, interval: Duration) {
    if interval.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let limiter = rate_limiter.current();
        let removed = limiter.sweep();
        if removed > 0 {
            debug!(removed, remaining = limiter.counter_count(), "Swept idle rate limit counters");
        }
    }
}
