//! Rate limiting logic and state management.

mod backend;
mod counter;
mod key;
mod limiter;
mod quota;
mod resolver;
mod rules;

pub use backend::{RateLimitBackend, ReloadableRateLimiter};
pub use counter::{CounterStore, QuotaOutcome, QuotaUsage, SlidingWindow, TimeWindow};
pub use key::{CounterKey, LimitKeyType, UNRESOLVED_KEY};
pub use limiter::{
    RateLimitResponse, RateLimiter, RATELIMIT_LIMIT, RATELIMIT_REMAINING, RATELIMIT_RESET,
    RETRY_AFTER,
};
pub use quota::{parse_quota_list, LimitQuota};
pub use resolver::{
    ClaimResolver, ForwardedAddressResolver, HeaderResolver, KeyResolver, RemoteAddressResolver,
    ResolverRegistry, API_KEY_HEADER, FORWARDED_ADDRESS, JWT_CLIENT_ID, JWT_USER_ID,
    REMOTE_ADDRESS,
};
pub use rules::{KeyRules, LimitConfig, LimitPolicy, PathRules, QuotaList, QuotaSetting, RuleSet};
