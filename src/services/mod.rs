pub mod metrics;
pub mod rate_limit;

pub use metrics::MetricsCollector;
pub use rate_limit::{client_ip, client_key, RateLimitDecision, RateLimiter};
