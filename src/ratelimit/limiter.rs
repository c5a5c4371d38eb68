//! Core rate limiter implementation.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::counter::{CounterStore, QuotaOutcome, TimeWindow};
use super::key::CounterKey;
use super::resolver::{KeyResolver, ResolverRegistry};
use super::rules::LimitPolicy;
use crate::clock::{Clock, SystemClock};
use crate::context::RequestContext;
use crate::error::Result;

pub const RATELIMIT_LIMIT: &str = "X-RateLimit-Limit";
pub const RATELIMIT_REMAINING: &str = "X-RateLimit-Remaining";
pub const RATELIMIT_RESET: &str = "X-RateLimit-Reset";
pub const RETRY_AFTER: &str = "Retry-After";

/// Decision for a single request.
///
/// Serialised as the JSON body of a denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResponse {
    pub allow: bool,
    pub headers: BTreeMap<String, String>,
}

impl RateLimitResponse {
    fn from_outcome(outcome: &QuotaOutcome) -> Self {
        let usage = &outcome.usage;
        let mut headers = BTreeMap::new();
        headers.insert(RATELIMIT_LIMIT.to_string(), usage.quota.to_string());
        headers.insert(RATELIMIT_REMAINING.to_string(), usage.remaining().to_string());
        headers.insert(RATELIMIT_RESET.to_string(), usage.reset_secs.to_string());
        if !outcome.allowed {
            headers.insert(RETRY_AFTER.to_string(), usage.retry_after_secs.to_string());
        }

        Self {
            allow: outcome.allowed,
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Seconds the caller should wait before retrying, set on denials only.
    pub fn retry_after(&self) -> Option<u64> {
        self.header(RETRY_AFTER)?.parse().ok()
    }
}

/// The core rate limiter that manages rate limit counters.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct RateLimiter {
    policy: LimitPolicy,
    /// Resolver for the configured key type, absent for server limits
    resolver: Option<Arc<dyn KeyResolver>>,
    /// Sliding window counters indexed by counter key
    counters: CounterStore,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter using the system clock.
    pub fn new(policy: LimitPolicy, registry: &ResolverRegistry) -> Result<Self> {
        Self::with_clock(policy, registry, Arc::new(SystemClock))
    }

    /// Create a rate limiter reading time from `clock`.
    ///
    /// Fails if the resolver named for the configured key type is not registered.
    pub fn with_clock(
        policy: LimitPolicy,
        registry: &ResolverRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let resolver = policy
            .resolver_name()
            .map(|name| registry.build(name))
            .transpose()?;

        info!(
            enabled = policy.enabled,
            key = %policy.key_type,
            resolver = policy.resolver_name().unwrap_or("path"),
            defaults = policy.rules.defaults.len(),
            "Rate limiter initialized"
        );

        Ok(Self {
            policy,
            resolver,
            counters: CounterStore::new(),
            clock,
        })
    }

    /// Check the rate limit for a request and count it if allowed.
    ///
    /// Returns `None` when limiting is disabled.
    pub fn check(&self, ctx: &RequestContext<'_>) -> Option<RateLimitResponse> {
        if !self.policy.enabled {
            return None;
        }

        let resolved = self.resolver.as_ref().and_then(|r| r.resolve(ctx));
        let (key, quotas) = self.policy.rules.select(resolved.as_deref(), ctx.path);
        let now = self.clock.now_secs();

        trace!(key = %key, path = ctx.path, "Checking rate limit");

        let outcome = self.counters.record_and_check(&key, quotas, now)?;
        if !outcome.allowed {
            debug!(
                key = %key,
                quota = %outcome.usage.quota,
                retry_after = outcome.usage.retry_after_secs,
                "Rate limit exceeded"
            );
        }

        Some(RateLimitResponse::from_outcome(&outcome))
    }

    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    /// Requests currently counted for `key` in `unit`.
    pub fn current_count(&self, key: &CounterKey, unit: TimeWindow) -> u64 {
        self.counters
            .current_count(key, unit, self.clock.now_secs())
    }

    /// Drop counters with no live requests, returning how many were removed.
    pub fn sweep(&self) -> usize {
        self.counters.sweep(self.clock.now_secs())
    }

    /// Clear all counters.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.counters.clear();
    }

    /// Get the number of active counters.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}
