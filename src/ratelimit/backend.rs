//! Rate limiter trait for abstracting fixed and hot-reloadable implementations.

use arc_swap::ArcSwap;
use http::StatusCode;
use std::sync::Arc;
use tracing::info;

use super::limiter::{RateLimitResponse, RateLimiter};
use super::resolver::ResolverRegistry;
use super::rules::LimitConfig;
use crate::clock::{Clock, SystemClock};
use crate::context::RequestContext;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over a fixed `RateLimiter` and a
/// `ReloadableRateLimiter` so the middleware can work with either.
pub trait RateLimitBackend: Send + Sync {
    /// Check the rate limit for a request. `None` means no decision was made.
    fn check(&self, ctx: &RequestContext<'_>) -> Option<RateLimitResponse>;

    /// Status to reply with when a request is denied.
    fn error_code(&self) -> StatusCode;

    /// Whether allowed responses also carry the rate limit headers.
    fn headers_always_set(&self) -> bool;
}

impl RateLimitBackend for RateLimiter {
    fn check(&self, ctx: &RequestContext<'_>) -> Option<RateLimitResponse> {
        RateLimiter::check(self, ctx)
    }

    fn error_code(&self) -> StatusCode {
        self.policy().error_code
    }

    fn headers_always_set(&self) -> bool {
        self.policy().headers_always_set
    }
}

impl<T: RateLimitBackend + ?Sized> RateLimitBackend for Arc<T> {
    fn check(&self, ctx: &RequestContext<'_>) -> Option<RateLimitResponse> {
        (**self).check(ctx)
    }

    fn error_code(&self) -> StatusCode {
        (**self).error_code()
    }

    fn headers_always_set(&self) -> bool {
        (**self).headers_always_set()
    }
}

/// A rate limiter whose configuration can be replaced while serving.
///
/// A reload builds a complete new limiter and swaps it in atomically, so
/// in-flight checks finish against the old one and counters start fresh.
#[derive(Debug)]
pub struct ReloadableRateLimiter {
    current: ArcSwap<RateLimiter>,
    registry: Arc<ResolverRegistry>,
    clock: Arc<dyn Clock>,
}

impl ReloadableRateLimiter {
    pub fn new(config: &LimitConfig, registry: Arc<ResolverRegistry>) -> Result<Self> {
        Self::with_clock(config, registry, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &LimitConfig,
        registry: Arc<ResolverRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let limiter = RateLimiter::with_clock(config.validate()?, &registry, clock.clone())?;
        Ok(Self {
            current: ArcSwap::from_pointee(limiter),
            registry,
            clock,
        })
    }

    /// Validate `config` and swap in a limiter built from it.
    ///
    /// On error the running limiter is left untouched.
    pub fn reload(&self, config: &LimitConfig) -> Result<()> {
        let limiter =
            RateLimiter::with_clock(config.validate()?, &self.registry, self.clock.clone())?;
        self.current.store(Arc::new(limiter));
        info!(enabled = config.enabled, key = %config.key, "Rate limit configuration reloaded");
        Ok(())
    }

    /// The limiter currently serving requests.
    pub fn current(&self) -> Arc<RateLimiter> {
        self.current.load_full()
    }
}

impl RateLimitBackend for ReloadableRateLimiter {
    fn check(&self, ctx: &RequestContext<'_>) -> Option<RateLimitResponse> {
        self.current.load().check(ctx)
    }

    fn error_code(&self) -> StatusCode {
        self.current.load().policy().error_code
    }

    fn headers_always_set(&self) -> bool {
        self.current.load().policy().headers_always_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use http::HeaderMap;

    fn reloadable(yaml: &str) -> ReloadableRateLimiter {
        let config = LimitConfig::from_yaml(yaml).unwrap();
        ReloadableRateLimiter::with_clock(
            &config,
            Arc::new(ResolverRegistry::default()),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap()
    }

    #[test]
    fn test_reload_swaps_policy_and_resets_counters() {
        let limiter = reloadable("enabled: true\nrateLimit: 1/m");
        let headers = HeaderMap::new();
        let ctx = RequestContext::new("/", &headers);

        assert!(limiter.check(&ctx).unwrap().allow);
        assert!(!limiter.check(&ctx).unwrap().allow);

        let config = LimitConfig::from_yaml("enabled: true\nrateLimit: 1/m\nerrorCode: 429").unwrap();
        limiter.reload(&config).unwrap();

        assert_eq!(limiter.error_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limiter.current().counter_count(), 0);
        assert!(limiter.check(&ctx).unwrap().allow);
    }

    #[test]
    fn test_invalid_reload_keeps_previous_limiter() {
        let limiter = reloadable("enabled: true\nrateLimit: 1/m\nheadersAlwaysSet: true");
        let headers = HeaderMap::new();
        let ctx = RequestContext::new("/", &headers);
        assert!(limiter.check(&ctx).unwrap().allow);

        let broken = LimitConfig::from_yaml("enabled: true\nrateLimit: often").unwrap();
        assert!(limiter.reload(&broken).is_err());

        assert!(limiter.headers_always_set());
        assert!(!limiter.check(&ctx).unwrap().allow);
    }

    #[test]
    fn test_backend_through_arc() {
        let limiter: Arc<dyn RateLimitBackend> = Arc::new(reloadable("enabled: false"));
        let headers = HeaderMap::new();

        assert!(limiter.check(&RequestContext::new("/", &headers)).is_none());
        assert_eq!(limiter.error_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
