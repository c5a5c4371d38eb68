//! Turnstile - In-process rate limiting and admission control for HTTP services
//!
//! This crate keeps sliding time-window counters per key (request path, caller
//! address, client id or user id) and enforces several quotas at once. A
//! separate admission limiter caps the number of in-flight requests and queues
//! the overflow. Both are exposed as tower layers.

pub mod admission;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod reload;

pub use admission::{AdmissionError, AdmissionPermit, RequestLimit};
pub use context::{AuditInfo, RequestContext};
pub use error::{Result, TurnstileError};
pub use middleware::{RateLimitLayer, RequestLimitLayer};
pub use ratelimit::{LimitConfig, RateLimitBackend, RateLimiter, ReloadableRateLimiter};
