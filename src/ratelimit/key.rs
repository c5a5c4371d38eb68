//! Counter key generation and handling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Key used for callers whose identity could not be resolved.
pub const UNRESOLVED_KEY: &str = "unknown";

/// What a configuration limits requests by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKeyType {
    /// Per request path, shared by every caller
    #[default]
    Server,
    /// Per caller network address
    Address,
    /// Per client id taken from the caller's credential
    Client,
    /// Per authenticated end user
    User,
}

impl LimitKeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKeyType::Server => "server",
            LimitKeyType::Address => "address",
            LimitKeyType::Client => "client",
            LimitKeyType::User => "user",
        }
    }
}

impl fmt::Display for LimitKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies one set of window counters.
///
/// `path` is only set when a per-path override inside a keyed rule applies,
/// so those requests are counted apart from the key's other traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The kind of key
    pub key_type: LimitKeyType,
    /// Resolved caller identity, or the request path for server limits
    pub key: String,
    /// Matched path pattern of a per-path override
    pub path: Option<String>,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(key_type: LimitKeyType, key: impl Into<String>) -> Self {
        Self {
            key_type,
            key: key.into(),
            path: None,
        }
    }

    /// Scope the key to a per-path override.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Convert the counter key to a string representation.
    pub fn to_string_key(&self) -> String {
        match &self.path {
            Some(path) => format!("{}:{}:{}", self.key_type, self.key, path),
            None => format!("{}:{}", self.key_type, self.key),
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_key_creation() {
        let key = CounterKey::new(LimitKeyType::Address, "10.0.0.1");

        assert_eq!(key.key_type, LimitKeyType::Address);
        assert_eq!(key.key, "10.0.0.1");
        assert!(key.path.is_none());
    }

    #[test]
    fn test_counter_key_to_string() {
        let key = CounterKey::new(LimitKeyType::Server, "/v1/users");
        assert_eq!(key.to_string_key(), "server:/v1/users");

        let key = CounterKey::new(LimitKeyType::Client, "billing").with_path("/v1/invoices");
        assert_eq!(key.to_string(), "client:billing:/v1/invoices");
    }

    #[test]
    fn test_counter_key_equality() {
        let plain = CounterKey::new(LimitKeyType::User, "alice");
        let scoped = CounterKey::new(LimitKeyType::User, "alice").with_path("/v1");

        assert_eq!(plain, CounterKey::new(LimitKeyType::User, "alice"));
        assert_ne!(plain, scoped);
        assert_ne!(plain, CounterKey::new(LimitKeyType::Client, "alice"));
    }

    #[test]
    fn test_key_type_deserializes_lowercase() {
        let key_type: LimitKeyType = serde_yaml::from_str("address").unwrap();
        assert_eq!(key_type, LimitKeyType::Address);
        assert!(serde_yaml::from_str::<LimitKeyType>("tenant").is_err());
    }
}
