//! Sliding window request counters.
//!
//! Each counter key owns one bucket map per time unit, mapping the epoch second
//! a request arrived in to the number of requests seen in that second. Usage is
//! the sum of every bucket younger than the unit, so limits roll smoothly
//! instead of resetting on fixed boundaries.

use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

use super::key::CounterKey;
use super::quota::LimitQuota;

/// Time window for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    /// Length of the window in whole seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            TimeWindow::Second => 1,
            TimeWindow::Minute => 60,
            TimeWindow::Hour => 3600,
            TimeWindow::Day => 86400,
        }
    }

    /// Short code used in quota strings.
    pub fn code(&self) -> char {
        match self {
            TimeWindow::Second => 's',
            TimeWindow::Minute => 'm',
            TimeWindow::Hour => 'h',
            TimeWindow::Day => 'd',
        }
    }

    /// Parse a unit code (`s`) or name (`second`, `seconds`), ignoring case.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_ascii_lowercase().as_str() {
            "s" | "second" | "seconds" => Some(TimeWindow::Second),
            "m" | "minute" | "minutes" => Some(TimeWindow::Minute),
            "h" | "hour" | "hours" => Some(TimeWindow::Hour),
            "d" | "day" | "days" => Some(TimeWindow::Day),
            _ => None,
        }
    }
}

/// Usage of a single quota observed while evaluating a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaUsage {
    /// The quota this usage belongs to
    pub quota: LimitQuota,
    /// Requests counted in the window, including the current one when allowed
    pub count: u64,
    /// Seconds until the oldest counted bucket leaves the window
    pub reset_secs: u64,
    /// Seconds until enough buckets expire to admit one more request
    pub retry_after_secs: u64,
}

impl QuotaUsage {
    /// Requests left in the window, clamped at zero.
    pub fn remaining(&self) -> u64 {
        self.quota.value.saturating_sub(self.count)
    }
}

/// Result of recording a request against a set of quotas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaOutcome {
    /// Whether every quota admitted the request
    pub allowed: bool,
    /// The quota reported back to the caller: the first one that denied, or
    /// the one closest to exhaustion when allowed
    pub usage: QuotaUsage,
}

/// Bucketed request history for one counter key.
#[derive(Debug, Default)]
pub struct SlidingWindow {
    buckets: HashMap<TimeWindow, BTreeMap<u64, u64>>,
}

impl SlidingWindow {
    /// Evaluate every quota and, only if all of them admit the request, count it.
    ///
    /// Returns `None` when `quotas` is empty.
    pub fn record_and_check(&mut self, quotas: &[LimitQuota], now: u64) -> Option<QuotaOutcome> {
        if quotas.is_empty() {
            return None;
        }

        let mut observed = Vec::with_capacity(quotas.len());
        for quota in quotas {
            let buckets = self.buckets.entry(quota.unit).or_default();
            prune(buckets, now, quota.unit.seconds());
            observed.push(buckets.values().sum::<u64>());
        }

        // A retry only succeeds once every denying quota has room again, so
        // report the one that frees up last. Ties keep config order.
        let mut denied: Option<QuotaUsage> = None;
        for (quota, &count) in quotas.iter().zip(&observed) {
            if count < quota.value {
                continue;
            }
            let span = quota.unit.seconds();
            let buckets = &self.buckets[&quota.unit];
            let retry_after_secs = retry_after(buckets, now, span, count, quota.value);
            if denied
                .as_ref()
                .map_or(true, |usage| retry_after_secs > usage.retry_after_secs)
            {
                denied = Some(QuotaUsage {
                    quota: *quota,
                    count,
                    reset_secs: reset_after(buckets, now, span),
                    retry_after_secs,
                });
            }
        }

        if let Some(usage) = denied {
            return Some(QuotaOutcome {
                allowed: false,
                usage,
            });
        }

        // Quotas sharing a unit share one bucket map; count the request once per unit.
        let mut units: Vec<_> = quotas.iter().map(|quota| quota.unit).collect();
        units.sort();
        units.dedup();
        for unit in units {
            *self
                .buckets
                .entry(unit)
                .or_default()
                .entry(now)
                .or_insert(0) += 1;
        }

        let (index, quota) = quotas
            .iter()
            .enumerate()
            .min_by_key(|(index, quota)| quota.value - (observed[*index] + 1))?;
        let span = quota.unit.seconds();
        let buckets = &self.buckets[&quota.unit];
        Some(QuotaOutcome {
            allowed: true,
            usage: QuotaUsage {
                quota: *quota,
                count: observed[index] + 1,
                reset_secs: reset_after(buckets, now, span),
                retry_after_secs: 0,
            },
        })
    }

    /// Requests currently counted for `unit`.
    pub fn count(&mut self, unit: TimeWindow, now: u64) -> u64 {
        match self.buckets.get_mut(&unit) {
            Some(buckets) => {
                prune(buckets, now, unit.seconds());
                buckets.values().sum()
            }
            None => 0,
        }
    }

    /// Drop every expired bucket for every unit.
    pub fn prune_all(&mut self, now: u64) {
        for (unit, buckets) in self.buckets.iter_mut() {
            prune(buckets, now, unit.seconds());
        }
    }

    /// True when no live bucket remains.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(BTreeMap::is_empty)
    }
}

fn prune(buckets: &mut BTreeMap<u64, u64>, now: u64, span: u64) {
    buckets.retain(|start, _| now.saturating_sub(*start) < span);
}

fn reset_after(buckets: &BTreeMap<u64, u64>, now: u64, span: u64) -> u64 {
    buckets
        .keys()
        .next()
        .map(|oldest| (oldest + span).saturating_sub(now))
        .unwrap_or(span)
        .max(1)
}

fn retry_after(buckets: &BTreeMap<u64, u64>, now: u64, span: u64, count: u64, limit: u64) -> u64 {
    if limit == 0 {
        return span;
    }

    let mut freed = 0;
    for (start, hits) in buckets {
        freed += hits;
        if count - freed < limit {
            return (start + span).saturating_sub(now).max(1);
        }
    }
    span
}

/// Concurrent map of counter key to its sliding window.
///
/// The check-and-increment for a key runs while holding that key's map entry,
/// so concurrent requests against one key are serialised and never overshoot
/// the limit.
#[derive(Debug, Default)]
pub struct CounterStore {
    windows: DashMap<CounterKey, SlidingWindow>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request for `key` if every quota admits it.
    pub fn record_and_check(
        &self,
        key: &CounterKey,
        quotas: &[LimitQuota],
        now: u64,
    ) -> Option<QuotaOutcome> {
        if let Some(mut window) = self.windows.get_mut(key) {
            return window.record_and_check(quotas, now);
        }

        let mut window = self.windows.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "Creating window counter");
            SlidingWindow::default()
        });
        window.record_and_check(quotas, now)
    }

    /// Requests currently counted for `key` in `unit`.
    pub fn current_count(&self, key: &CounterKey, unit: TimeWindow, now: u64) -> u64 {
        self.windows
            .get_mut(key)
            .map(|mut window| window.count(unit, now))
            .unwrap_or(0)
    }

    /// Remove keys whose buckets have all expired, returning how many were dropped.
    pub fn sweep(&self, now: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window.prune_all(now);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.windows.clear();
    }
}
