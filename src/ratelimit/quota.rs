//! Quota values such as `100/m`.

use std::fmt;
use std::str::FromStr;

use super::counter::TimeWindow;
use crate::error::{Result, TurnstileError};

/// A request budget: at most `value` requests per `unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LimitQuota {
    /// Requests allowed within one window
    pub value: u64,
    /// Length of the window
    pub unit: TimeWindow,
}

impl LimitQuota {
    /// Create a new quota.
    pub fn new(value: u64, unit: TimeWindow) -> Self {
        Self { value, unit }
    }
}

impl FromStr for LimitQuota {
    type Err = TurnstileError;

    fn from_str(input: &str) -> Result<Self> {
        let (value, unit) = input
            .trim()
            .split_once('/')
            .ok_or_else(|| TurnstileError::invalid_quota(input, "expected '<count>/<unit>'"))?;

        let value = value.trim().parse::<u64>().map_err(|_| {
            TurnstileError::invalid_quota(input, "count must be a non-negative integer")
        })?;
        let unit = TimeWindow::from_code(unit.trim()).ok_or_else(|| {
            TurnstileError::invalid_quota(input, "unit must be one of s, m, h, d")
        })?;

        Ok(Self { value, unit })
    }
}

impl fmt::Display for LimitQuota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.unit.code())
    }
}

/// Parse a whitespace separated list such as `"10/s 10000/d"`.
pub fn parse_quota_list(input: &str) -> Result<Vec<LimitQuota>> {
    let quotas = input
        .split_whitespace()
        .map(LimitQuota::from_str)
        .collect::<Result<Vec<_>>>()?;

    if quotas.is_empty() {
        return Err(TurnstileError::invalid_quota(input, "no quotas given"));
    }
    Ok(quotas)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let quota: LimitQuota = "100/m".parse().unwrap();
        assert_eq!(quota, LimitQuota::new(100, TimeWindow::Minute));
        assert_eq!(quota.to_string(), "100/m");
    }

    #[test]
    fn test_parse_long_unit_names() {
        let quota: LimitQuota = " 5 / Seconds ".parse().unwrap();
        assert_eq!(quota, LimitQuota::new(5, TimeWindow::Second));

        let quota: LimitQuota = "7/day".parse().unwrap();
        assert_eq!(quota.unit, TimeWindow::Day);
    }

    #[test]
    fn test_parse_zero_is_valid() {
        let quota: LimitQuota = "0/h".parse().unwrap();
        assert_eq!(quota.value, 0);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["100", "abc/s", "-1/s", "10/w", "/s", ""] {
            let err = bad.parse::<LimitQuota>().unwrap_err();
            assert!(
                matches!(err, TurnstileError::InvalidQuota { .. }),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_quota_list() {
        let quotas = parse_quota_list("10/s  10000/d").unwrap();
        assert_eq!(
            quotas,
            vec![
                LimitQuota::new(10, TimeWindow::Second),
                LimitQuota::new(10000, TimeWindow::Day)
            ]
        );
    }

    #[test]
    fn test_parse_quota_list_rejects_empty_and_partial() {
        assert!(parse_quota_list("   ").is_err());
        assert!(parse_quota_list("10/s ten/m").is_err());
    }
}
