use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Admission control settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Capacity and per-minute refill of the global bucket
    pub max_requests_per_minute: u32,

    /// Parsed and validated, not enforced
    pub max_tokens_per_minute: u32,

    /// Capacity and per-minute refill of each caller bucket
    pub per_agent_limit: u32,

    /// Parsed and validated, not enforced
    pub per_agent_token_limit: u32,

    pub backoff: BackoffConfig,

    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests_per_minute: 60,
            max_tokens_per_minute: 100_000,
            per_agent_limit: 20,
            per_agent_token_limit: 40_000,
            backoff: BackoffConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    pub multiplier: f64,

    /// Inflate bucket waits by a random 0-25%
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Upper bound for the `attempt`-th sleep (1-based) while polling for a slot
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0)).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,

    pub failure_threshold: u32,

    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}
