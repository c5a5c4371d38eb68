//! Tower layers that put the limiters in front of an HTTP service.
//!
//! Stack [`RequestLimitLayer`] outside [`RateLimitLayer`] so requests are
//! admitted before they are counted.

mod rate_limit;
mod request_limit;

pub use rate_limit::{RateLimitLayer, RateLimitService};
pub use request_limit::{JsonRejection, RejectionHandler, RequestLimitLayer, RequestLimitService};
