//! Admission control for calls to the external agent.
//!
//! A [`RateLimiter`] holds one global [`TokenBucket`] plus a bucket and
//! circuit breaker per caller. Callers ask for a slot with
//! [`RateLimiter::acquire`] or [`RateLimiter::wait_for_slot`] and report the
//! outcome of the guarded call afterwards.

pub mod bucket;
pub mod config;
pub mod limiter;

pub use bucket::TokenBucket;
pub use config::{BackoffConfig, CircuitBreakerConfig, RateLimitConfig};
pub use limiter::{
    AdmissionDecision, BucketStatus, CallerStatus, LimiterStatus, RateLimiter, RejectReason,
};

/// Whether an agent's error output says it was throttled upstream
pub fn is_rate_limit_signal(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("429")
        || lower.contains("too many requests")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_signal_detection() {
        assert!(is_rate_limit_signal("Error: Rate limit reached for requests"));
        assert!(is_rate_limit_signal("HTTP 429"));
        assert!(is_rate_limit_signal("Too Many Requests"));
        assert!(is_rate_limit_signal("{\"type\":\"rate_limit_error\"}"));
        assert!(!is_rate_limit_signal("syntax error in main.rs"));
    }
}
