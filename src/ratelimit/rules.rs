//! Rate limit rules configuration and matching.
//!
//! [`LimitConfig`] is the raw `limit.yml` document as written by operators. It is
//! validated once into a [`LimitPolicy`], whose [`RuleSet`] decides which counter
//! key and which quotas apply to a request.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::key::{CounterKey, LimitKeyType, UNRESOLVED_KEY};
use super::quota::{parse_quota_list, LimitQuota};
use super::resolver::{JWT_CLIENT_ID, JWT_USER_ID, REMOTE_ADDRESS};
use crate::error::{Result, TurnstileError};

/// A quota list written either as `"10/s 10000/d"` or as a sequence of quotas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuotaList {
    Text(String),
    Items(Vec<String>),
}

impl QuotaList {
    /// Parse every quota in the list.
    pub fn parse(&self) -> Result<Vec<LimitQuota>> {
        match self {
            QuotaList::Text(text) => parse_quota_list(text),
            QuotaList::Items(items) => parse_quota_list(&items.join(" ")),
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            QuotaList::Text(text) => text.trim().is_empty(),
            QuotaList::Items(items) => items.iter().all(|item| item.trim().is_empty()),
        }
    }
}

impl From<&str> for QuotaList {
    fn from(text: &str) -> Self {
        QuotaList::Text(text.to_string())
    }
}

/// Rule for one key: either quotas for all its traffic, or quotas per path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuotaSetting {
    Quotas(QuotaList),
    Paths(BTreeMap<String, QuotaList>),
}

fn default_concurrent_request() -> usize {
    2
}

fn default_queue_size() -> i64 {
    -1
}

fn default_error_code() -> u16 {
    503
}

fn default_rate_limit() -> QuotaList {
    QuotaList::from("10/s 10000/d")
}

fn default_client_resolver() -> String {
    JWT_CLIENT_ID.to_string()
}

fn default_address_resolver() -> String {
    REMOTE_ADDRESS.to_string()
}

fn default_user_resolver() -> String {
    JWT_USER_ID.to_string()
}

/// The limit configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitConfig {
    /// Whether limiting is applied at all
    #[serde(default)]
    pub enabled: bool,
    /// What requests are counted by
    #[serde(default)]
    pub key: LimitKeyType,
    /// Maximum number of requests in flight
    #[serde(default = "default_concurrent_request")]
    pub concurrent_request: usize,
    /// Maximum number of queued requests, negative for unbounded
    #[serde(default = "default_queue_size")]
    pub queue_size: i64,
    /// How long a queued request may wait for a slot
    #[serde(default)]
    pub queue_timeout_ms: Option<u64>,
    /// Status returned when a request is rejected
    #[serde(default = "default_error_code")]
    pub error_code: u16,
    /// Attach rate limit headers to allowed responses too
    #[serde(default)]
    pub headers_always_set: bool,
    /// Default quotas
    #[serde(default = "default_rate_limit")]
    pub rate_limit: QuotaList,
    /// Per path quotas for server limits
    #[serde(default)]
    pub server: BTreeMap<String, QuotaList>,
    /// Per address overrides
    #[serde(default)]
    pub address: BTreeMap<String, QuotaSetting>,
    /// Per client overrides
    #[serde(default)]
    pub client: BTreeMap<String, QuotaSetting>,
    /// Per user overrides
    #[serde(default)]
    pub user: BTreeMap<String, QuotaSetting>,
    #[serde(default = "default_client_resolver")]
    pub client_id_key_resolver: String,
    #[serde(default = "default_address_resolver")]
    pub address_key_resolver: String,
    #[serde(default = "default_user_resolver")]
    pub user_id_key_resolver: String,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key: LimitKeyType::default(),
            concurrent_request: default_concurrent_request(),
            queue_size: default_queue_size(),
            queue_timeout_ms: None,
            error_code: default_error_code(),
            headers_always_set: false,
            rate_limit: default_rate_limit(),
            server: BTreeMap::new(),
            address: BTreeMap::new(),
            client: BTreeMap::new(),
            user: BTreeMap::new(),
            client_id_key_resolver: default_client_resolver(),
            address_key_resolver: default_address_resolver(),
            user_id_key_resolver: default_user_resolver(),
        }
    }
}

impl LimitConfig {
    /// Load configuration from a file. `.json` files are read as JSON, anything
    /// else as YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Check every field and build the policy used at runtime.
    pub fn validate(&self) -> Result<LimitPolicy> {
        if self.concurrent_request == 0 {
            return Err(TurnstileError::Config(
                "concurrentRequest must be at least 1".to_string(),
            ));
        }

        if !(100..=599).contains(&self.error_code) {
            return Err(TurnstileError::Config(format!(
                "errorCode {} is not an HTTP status",
                self.error_code
            )));
        }
        let error_code = StatusCode::from_u16(self.error_code)
            .map_err(|e| TurnstileError::Config(format!("errorCode {}: {}", self.error_code, e)))?;

        let defaults = if !self.enabled && self.rate_limit.is_blank() {
            Vec::new()
        } else {
            self.rate_limit.parse()?
        };

        let rules = RuleSet {
            key_type: self.key,
            defaults,
            server: PathRules::new(&self.server)?,
            address: build_key_rules(&self.address)?,
            client: build_key_rules(&self.client)?,
            user: build_key_rules(&self.user)?,
        };

        Ok(LimitPolicy {
            enabled: self.enabled,
            key_type: self.key,
            concurrent_request: self.concurrent_request,
            queue_size: usize::try_from(self.queue_size).ok(),
            queue_timeout: self.queue_timeout_ms.map(Duration::from_millis),
            error_code,
            headers_always_set: self.headers_always_set,
            rules,
            client_id_key_resolver: self.client_id_key_resolver.clone(),
            address_key_resolver: self.address_key_resolver.clone(),
            user_id_key_resolver: self.user_id_key_resolver.clone(),
        })
    }
}

fn build_key_rules(settings: &BTreeMap<String, QuotaSetting>) -> Result<HashMap<String, KeyRules>> {
    settings
        .iter()
        .map(|(key, setting)| {
            let rules = match setting {
                QuotaSetting::Quotas(list) => KeyRules::Direct(list.parse()?),
                QuotaSetting::Paths(paths) => KeyRules::ByPath(PathRules::new(paths)?),
            };
            Ok((key.clone(), rules))
        })
        .collect()
}

/// Validated limit configuration.
#[derive(Debug, Clone)]
pub struct LimitPolicy {
    pub enabled: bool,
    pub key_type: LimitKeyType,
    pub concurrent_request: usize,
    /// `None` when the queue is unbounded
    pub queue_size: Option<usize>,
    pub queue_timeout: Option<Duration>,
    pub error_code: StatusCode,
    pub headers_always_set: bool,
    pub rules: RuleSet,
    pub client_id_key_resolver: String,
    pub address_key_resolver: String,
    pub user_id_key_resolver: String,
}

impl LimitPolicy {
    /// Name of the resolver that produces keys for the configured key type.
    /// Server limits are keyed by path and need none.
    pub fn resolver_name(&self) -> Option<&str> {
        match self.key_type {
            LimitKeyType::Server => None,
            LimitKeyType::Address => Some(&self.address_key_resolver),
            LimitKeyType::Client => Some(&self.client_id_key_resolver),
            LimitKeyType::User => Some(&self.user_id_key_resolver),
        }
    }
}

/// Path patterns mapped to quotas, ordered so the longest pattern is tried first.
#[derive(Debug, Clone, Default)]
pub struct PathRules {
    entries: Vec<(String, Vec<LimitQuota>)>,
}

impl PathRules {
    pub fn new(paths: &BTreeMap<String, QuotaList>) -> Result<Self> {
        let mut entries = paths
            .iter()
            .map(|(pattern, list)| {
                if !pattern.starts_with('/') {
                    return Err(TurnstileError::Config(format!(
                        "path pattern '{}' must start with '/'",
                        pattern
                    )));
                }
                Ok((pattern.clone(), list.parse()?))
            })
            .collect::<Result<Vec<_>>>()?;

        entries.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Ok(Self { entries })
    }

    /// Find the most specific pattern matching `path`.
    pub fn lookup(&self, path: &str) -> Option<(&str, &[LimitQuota])> {
        self.entries
            .iter()
            .find(|(pattern, _)| path_matches(pattern, path))
            .map(|(pattern, quotas)| (pattern.as_str(), quotas.as_slice()))
    }
}

/// `pattern` matches the identical path and anything below it, segment-wise.
fn path_matches(pattern: &str, path: &str) -> bool {
    if pattern == path {
        return true;
    }
    let prefix = pattern.trim_end_matches('/');
    path.strip_prefix(prefix)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

/// Quotas configured for one resolved key.
#[derive(Debug, Clone)]
pub enum KeyRules {
    Direct(Vec<LimitQuota>),
    ByPath(PathRules),
}

/// Every rule of a configuration, keyed the way the limiter looks them up.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub key_type: LimitKeyType,
    pub defaults: Vec<LimitQuota>,
    pub server: PathRules,
    pub address: HashMap<String, KeyRules>,
    pub client: HashMap<String, KeyRules>,
    pub user: HashMap<String, KeyRules>,
}

impl RuleSet {
    /// Pick the counter key and quotas for a request.
    ///
    /// `key` is the resolved caller identity and is ignored for server limits.
    /// A missing or empty identity is counted under [`UNRESOLVED_KEY`].
    pub fn select(&self, key: Option<&str>, path: &str) -> (CounterKey, &[LimitQuota]) {
        let key_type = self.key_type;
        let by_key = match key_type {
            LimitKeyType::Server => {
                return match self.server.lookup(path) {
                    Some((pattern, quotas)) => (CounterKey::new(key_type, pattern), quotas),
                    None => (CounterKey::new(key_type, path), self.defaults.as_slice()),
                };
            }
            LimitKeyType::Address => &self.address,
            LimitKeyType::Client => &self.client,
            LimitKeyType::User => &self.user,
        };

        let key = match key.filter(|key| !key.is_empty()) {
            Some(key) => key,
            None => return (CounterKey::new(key_type, UNRESOLVED_KEY), self.defaults.as_slice()),
        };

        match by_key.get(key) {
            Some(KeyRules::Direct(quotas)) => (CounterKey::new(key_type, key), quotas.as_slice()),
            Some(KeyRules::ByPath(paths)) => match paths.lookup(path) {
                Some((pattern, quotas)) => {
                    (CounterKey::new(key_type, key).with_path(pattern), quotas)
                }
                None => (CounterKey::new(key_type, key), self.defaults.as_slice()),
            },
            None => (CounterKey::new(key_type, key), self.defaults.as_slice()),
        }
    }
}
