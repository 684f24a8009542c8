use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bucket::TokenBucket;
use super::config::RateLimitConfig;
use crate::error::ErrorCode;

const REFILL_INTERVAL: Duration = Duration::from_secs(1);
const JITTER_FACTOR: f64 = 0.25;
const MIN_POLL: Duration = Duration::from_millis(1);

/// Why an admission request was turned down
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    CircuitOpen,
    GlobalLimit,
    CallerLimit,
    MaxWaitExceeded { max_wait_ms: u64 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::CircuitOpen => write!(f, "Circuit breaker open"),
            RejectReason::GlobalLimit => write!(f, "Global rate limit exceeded"),
            RejectReason::CallerLimit => write!(f, "Agent rate limit exceeded"),
            RejectReason::MaxWaitExceeded { max_wait_ms } => {
                write!(f, "Max wait time ({max_wait_ms}ms) exceeded")
            }
        }
    }
}

impl RejectReason {
    pub fn code(&self) -> u16 {
        match self {
            RejectReason::CircuitOpen => ErrorCode::RATE_CIRCUIT_OPEN,
            RejectReason::GlobalLimit | RejectReason::CallerLimit => ErrorCode::RATE_LIMITED,
            RejectReason::MaxWaitExceeded { .. } => ErrorCode::RATE_MAX_WAIT_EXCEEDED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// Suggested wait before asking again
    pub wait: Duration,
    pub reason: Option<RejectReason>,
}

impl AdmissionDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            wait: Duration::ZERO,
            reason: None,
        }
    }

    fn reject(wait: Duration, reason: RejectReason) -> Self {
        Self {
            allowed: false,
            wait,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    pub available: u64,
    pub capacity: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerStatus {
    pub available: u64,
    pub capacity: f64,
    pub circuit_open: bool,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    pub enabled: bool,
    pub global: BucketStatus,
    pub callers: BTreeMap<String, CallerStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
}

#[derive(Debug)]
struct CallerState {
    bucket: TokenBucket,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    circuit: CircuitState,
}

impl CallerState {
    fn new(per_minute: u32, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::per_minute(per_minute, now),
            consecutive_failures: 0,
            last_failure_at: None,
            circuit: CircuitState::Closed,
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    global: TokenBucket,
    callers: HashMap<String, CallerState>,
}

impl LimiterState {
    fn refill_all(&mut self, now: Instant) {
        self.global.refill(now);
        for caller in self.callers.values_mut() {
            caller.bucket.refill(now);
        }
    }
}

/// Token-bucket admission control with a per-caller circuit breaker.
///
/// One global bucket bounds the total call rate; every caller gets its own
/// bucket and failure counter, created on its first request. All state sits
/// behind one lock, so a debit of both buckets is never partially visible.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Arc<Mutex<LimiterState>>,
    refill_task: Option<JoinHandle<()>>,
}

impl RateLimiter {
    /// Build a limiter. When enabled and called inside a tokio runtime, a
    /// background task refills every bucket once per second until the
    /// limiter is shut down or dropped.
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        let state = Arc::new(Mutex::new(LimiterState {
            global: TokenBucket::per_minute(config.max_requests_per_minute, now),
            callers: HashMap::new(),
        }));

        let refill_task = if config.enabled {
            tokio::runtime::Handle::try_current()
                .ok()
                .map(|handle| handle.spawn(Self::refill_loop(Arc::clone(&state))))
        } else {
            None
        };

        Self {
            config,
            state,
            refill_task,
        }
    }

    #[cfg(test)]
    fn without_background_refill(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                global: TokenBucket::per_minute(config.max_requests_per_minute, now),
                callers: HashMap::new(),
            })),
            config,
            refill_task: None,
        }
    }

    async fn refill_loop(state: Arc<Mutex<LimiterState>>) {
        let mut interval = tokio::time::interval(REFILL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            state.lock().await.refill_all(Instant::now());
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Stop the background refill. Lazy refill on every request keeps the
    /// limiter correct afterwards.
    pub fn shutdown(&self) {
        if let Some(task) = &self.refill_task {
            task.abort();
        }
    }

    /// Ask for `cost` tokens on behalf of `caller`. Never blocks on time.
    pub async fn acquire(&self, caller: &str, cost: u32) -> AdmissionDecision {
        if !self.config.enabled {
            return AdmissionDecision::allow();
        }

        let mut decision = self.acquire_at(caller, cost, Instant::now()).await;
        if matches!(
            decision.reason,
            Some(RejectReason::GlobalLimit | RejectReason::CallerLimit)
        ) && self.config.backoff.jitter
        {
            decision.wait = apply_jitter(decision.wait, rand::rng().random_range(0.0..1.0));
        }
        decision
    }

    async fn acquire_at(&self, caller: &str, cost: u32, now: Instant) -> AdmissionDecision {
        let cost = f64::from(cost);
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let caller_state = state
            .callers
            .entry(caller.to_string())
            .or_insert_with(|| CallerState::new(self.config.per_agent_limit, now));

        if let CircuitState::Open { opened_at } = caller_state.circuit {
            let since_open = now.saturating_duration_since(opened_at);
            let reset_timeout = self.config.circuit_breaker.reset_timeout;
            if since_open < reset_timeout {
                return AdmissionDecision::reject(reset_timeout - since_open, RejectReason::CircuitOpen);
            }
            // Half-open: let this request through as the trial call
            caller_state.circuit = CircuitState::Closed;
            caller_state.consecutive_failures = 0;
            debug!("Circuit breaker half-open for caller {}", caller);
        }

        state.global.refill(now);
        caller_state.bucket.refill(now);

        if !state.global.has(cost) {
            return AdmissionDecision::reject(state.global.wait_for(cost), RejectReason::GlobalLimit);
        }

        if !caller_state.bucket.has(cost) {
            return AdmissionDecision::reject(
                caller_state.bucket.wait_for(cost),
                RejectReason::CallerLimit,
            );
        }

        state.global.take(cost);
        caller_state.bucket.take(cost);
        AdmissionDecision::allow()
    }

    /// Poll `acquire` until it succeeds or `max_wait` has elapsed. Each sleep
    /// is the suggested wait, capped by the backoff schedule and the time
    /// left, and never shorter than a millisecond.
    pub async fn wait_for_slot(&self, caller: &str, cost: u32, max_wait: Duration) -> AdmissionDecision {
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let decision = self.acquire(caller, cost).await;
            if decision.allowed {
                return decision;
            }

            let elapsed = start.elapsed();
            if elapsed >= max_wait {
                break;
            }

            attempt = attempt.saturating_add(1);
            let sleep = decision
                .wait
                .min(self.config.backoff.delay_for_attempt(attempt))
                .min(max_wait - elapsed)
                .max(MIN_POLL);

            debug!(
                "Caller {} waiting {:?} for a slot ({})",
                caller,
                sleep,
                decision
                    .reason
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default()
            );
            tokio::time::sleep(sleep).await;
        }

        AdmissionDecision::reject(
            Duration::ZERO,
            RejectReason::MaxWaitExceeded {
                max_wait_ms: max_wait.as_millis() as u64,
            },
        )
    }

    /// Clear the caller's failure streak. The circuit flag is left alone.
    pub async fn report_success(&self, caller: &str) {
        let mut state = self.state.lock().await;
        if let Some(caller_state) = state.callers.get_mut(caller) {
            caller_state.consecutive_failures = 0;
            caller_state.last_failure_at = None;
        }
    }

    /// Count a failed call. A rate-limit signal from upstream also empties the
    /// caller's bucket. Unknown callers are ignored.
    pub async fn report_failure(&self, caller: &str, is_rate_limit_signal: bool) {
        self.report_failure_at(caller, is_rate_limit_signal, Instant::now())
            .await;
    }

    async fn report_failure_at(&self, caller: &str, is_rate_limit_signal: bool, now: Instant) {
        let mut state = self.state.lock().await;
        let Some(caller_state) = state.callers.get_mut(caller) else {
            return;
        };

        caller_state.consecutive_failures = caller_state.consecutive_failures.saturating_add(1);
        caller_state.last_failure_at = Some(now);

        let breaker = &self.config.circuit_breaker;
        if breaker.enabled
            && caller_state.consecutive_failures >= breaker.failure_threshold
            && caller_state.circuit == CircuitState::Closed
        {
            caller_state.circuit = CircuitState::Open { opened_at: now };
            warn!(
                "Circuit breaker opened for caller {} after {} consecutive failures",
                caller, caller_state.consecutive_failures
            );
        }

        if is_rate_limit_signal {
            caller_state.bucket.drain();
        }
    }

    /// Refill the caller's bucket and clear its failure and circuit state
    pub async fn reset(&self, caller: &str) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if let Some(caller_state) = state.callers.get_mut(caller) {
            caller_state.bucket.fill(now);
            caller_state.consecutive_failures = 0;
            caller_state.last_failure_at = None;
            caller_state.circuit = CircuitState::Closed;
            info!("Rate limiter reset for caller {}", caller);
        }
    }

    /// Refill the global bucket and forget every caller
    pub async fn reset_all(&self) {
        let mut state = self.state.lock().await;
        state.global.fill(Instant::now());
        state.callers.clear();
        info!("Rate limiter reset");
    }

    pub async fn status(&self) -> LimiterStatus {
        let mut state = self.state.lock().await;
        state.refill_all(Instant::now());

        let global = BucketStatus {
            available: state.global.available(),
            capacity: state.global.capacity(),
            percentage: state.global.tokens() / state.global.capacity() * 100.0,
        };

        let callers = state
            .callers
            .iter()
            .map(|(id, caller)| {
                (
                    id.clone(),
                    CallerStatus {
                        available: caller.bucket.available(),
                        capacity: caller.bucket.capacity(),
                        circuit_open: matches!(caller.circuit, CircuitState::Open { .. }),
                        consecutive_failures: caller.consecutive_failures,
                    },
                )
            })
            .collect();

        LimiterStatus {
            enabled: self.config.enabled,
            global,
            callers,
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(task) = self.refill_task.take() {
            task.abort();
        }
    }
}

/// Inflate `wait` by `roll × 25%`, rounded up to whole milliseconds.
/// `roll` is a uniform sample from `[0, 1)`.
fn apply_jitter(wait: Duration, roll: f64) -> Duration {
    let millis = wait.as_secs_f64() * 1000.0;
    let jittered = (millis + millis * JITTER_FACTOR * roll).ceil();
    Duration::from_millis(jittered as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{BackoffConfig, CircuitBreakerConfig};

    fn config(global: u32, per_caller: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            max_requests_per_minute: global,
            per_agent_limit: per_caller,
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(200),
                multiplier: 2.0,
                jitter: false,
            },
            circuit_breaker: CircuitBreakerConfig {
                enabled: true,
                failure_threshold: 3,
                reset_timeout: Duration::from_millis(100),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sixty_per_minute_admits_sixty_then_waits_a_second() {
        let limiter = RateLimiter::without_background_refill(config(60, 60));
        let now = Instant::now();

        for i in 0..60 {
            let decision = limiter.acquire_at("agent", 1, now).await;
            assert!(decision.allowed, "call {} should be admitted", i + 1);
        }

        let decision = limiter.acquire_at("agent", 1, now).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(RejectReason::GlobalLimit));
        assert_eq!(decision.wait, Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_sixty_one_immediate_calls_through_public_api() {
        let limiter = RateLimiter::new(config(60, 60));
        let mut allowed = 0;
        let mut last = None;
        for _ in 0..61 {
            let decision = limiter.acquire("agent", 1).await;
            if decision.allowed {
                allowed += 1;
            } else {
                last = Some(decision);
            }
        }

        assert_eq!(allowed, 60);
        let last = last.unwrap();
        assert!(last.wait <= Duration::from_millis(1000));
        assert!(last.wait >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_caller_bucket_limits_after_global() {
        let limiter = RateLimiter::without_background_refill(config(100, 2));
        let now = Instant::now();

        assert!(limiter.acquire_at("a", 1, now).await.allowed);
        assert!(limiter.acquire_at("a", 1, now).await.allowed);

        let decision = limiter.acquire_at("a", 1, now).await;
        assert_eq!(decision.reason, Some(RejectReason::CallerLimit));
        // 2 per minute = one token every 30 s
        assert_eq!(decision.wait, Duration::from_secs(30));

        // Another caller still has its own budget; global was only debited twice
        assert!(limiter.acquire_at("b", 1, now).await.allowed);
        let status = limiter.status().await;
        assert!(status.global.available >= 97);
    }

    #[tokio::test]
    async fn test_rejected_request_debits_nothing() {
        let limiter = RateLimiter::without_background_refill(config(100, 1));
        let now = Instant::now();

        assert!(limiter.acquire_at("a", 1, now).await.allowed);
        assert!(!limiter.acquire_at("a", 1, now).await.allowed);

        let state = limiter.state.lock().await;
        assert_eq!(state.global.tokens(), 99.0);
        assert_eq!(state.callers["a"].bucket.tokens(), 0.0);
    }

    #[tokio::test]
    async fn test_circuit_opens_and_half_opens_after_reset_timeout() {
        let limiter = RateLimiter::without_background_refill(config(100, 100));
        let t0 = Instant::now();

        assert!(limiter.acquire_at("a", 1, t0).await.allowed);
        for _ in 0..3 {
            limiter.report_failure_at("a", false, t0).await;
        }

        let decision = limiter
            .acquire_at("a", 1, t0 + Duration::from_millis(40))
            .await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(RejectReason::CircuitOpen));
        assert_eq!(decision.reason.as_ref().map(RejectReason::code), Some(ErrorCode::RATE_CIRCUIT_OPEN));
        assert_eq!(decision.wait, Duration::from_millis(60));

        let decision = limiter
            .acquire_at("a", 1, t0 + Duration::from_millis(100))
            .await;
        assert!(decision.allowed);

        let status = limiter.status().await;
        assert!(!status.callers["a"].circuit_open);
        assert_eq!(status.callers["a"].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_circuit_stays_closed_when_breaker_disabled() {
        let mut cfg = config(100, 100);
        cfg.circuit_breaker.enabled = false;
        let limiter = RateLimiter::new(cfg);

        assert!(limiter.acquire("a", 1).await.allowed);
        for _ in 0..10 {
            limiter.report_failure("a", false).await;
        }

        assert!(limiter.acquire("a", 1).await.allowed);
        assert_eq!(limiter.status().await.callers["a"].consecutive_failures, 10);
    }

    #[tokio::test]
    async fn test_report_success_resets_failures_but_not_circuit() {
        let limiter = RateLimiter::new(config(100, 100));
        assert!(limiter.acquire("a", 1).await.allowed);
        for _ in 0..3 {
            limiter.report_failure("a", false).await;
        }
        limiter.report_success("a").await;

        let status = limiter.status().await;
        assert_eq!(status.callers["a"].consecutive_failures, 0);
        assert!(status.callers["a"].circuit_open);
    }

    #[tokio::test]
    async fn test_rate_limit_signal_drains_caller_bucket() {
        let limiter = RateLimiter::without_background_refill(config(100, 10));
        let now = Instant::now();
        assert!(limiter.acquire_at("a", 1, now).await.allowed);

        limiter.report_failure_at("a", true, now).await;

        let decision = limiter.acquire_at("a", 1, now).await;
        assert_eq!(decision.reason, Some(RejectReason::CallerLimit));
        assert_eq!(decision.reason.as_ref().map(RejectReason::code), Some(ErrorCode::RATE_LIMITED));
        assert_eq!(decision.wait, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_report_failure_for_unknown_caller_is_noop() {
        let limiter = RateLimiter::new(config(100, 10));
        limiter.report_failure("ghost", true).await;
        limiter.report_success("ghost").await;
        assert!(limiter.status().await.callers.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_limiter_admits_everything() {
        let mut cfg = config(1, 1);
        cfg.enabled = false;
        let limiter = RateLimiter::new(cfg);
        for _ in 0..100 {
            assert!(limiter.acquire("a", 1).await.allowed);
        }
        assert!(limiter.refill_task.is_none());
    }

    #[tokio::test]
    async fn test_token_conservation_over_time() {
        let limiter = RateLimiter::without_background_refill(config(60, 60));
        let t0 = Instant::now();
        let mut allowed = 0u32;

        // Hammer the limiter every 100 ms for 10 simulated seconds
        for step in 0..=100u64 {
            let now = t0 + Duration::from_millis(step * 100);
            for _ in 0..5 {
                if limiter.acquire_at("a", 1, now).await.allowed {
                    allowed += 1;
                }
            }
        }

        // capacity + 10 s × 1 token/s
        assert!(allowed <= 70, "admitted {allowed}");
        assert!(allowed >= 69);
    }

    #[tokio::test]
    async fn test_reset_and_reset_all() {
        let limiter = RateLimiter::new(config(100, 5));
        for _ in 0..5 {
            assert!(limiter.acquire("a", 1).await.allowed);
        }
        for _ in 0..3 {
            limiter.report_failure("a", false).await;
        }

        limiter.reset("a").await;
        let status = limiter.status().await;
        assert_eq!(status.callers["a"].available, 5);
        assert!(!status.callers["a"].circuit_open);
        assert_eq!(status.callers["a"].consecutive_failures, 0);

        limiter.reset_all().await;
        let status = limiter.status().await;
        assert!(status.callers.is_empty());
        assert_eq!(status.global.available, 100);
        assert_eq!(status.global.percentage, 100.0);
    }

    #[tokio::test]
    async fn test_wait_for_slot_gives_up_after_max_wait() {
        let limiter = RateLimiter::new(config(100, 1));
        assert!(limiter.acquire("a", 1).await.allowed);

        let start = Instant::now();
        let decision = limiter
            .wait_for_slot("a", 1, Duration::from_millis(50))
            .await;

        assert!(!decision.allowed);
        assert_eq!(
            decision.reason,
            Some(RejectReason::MaxWaitExceeded { max_wait_ms: 50 })
        );
        let reason = decision.reason.unwrap();
        assert_eq!(reason.to_string(), "Max wait time (50ms) exceeded");
        assert_eq!(reason.code(), ErrorCode::RATE_MAX_WAIT_EXCEEDED);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_wait_for_slot_succeeds_once_circuit_half_opens() {
        let limiter = RateLimiter::new(config(100, 100));
        assert!(limiter.acquire("a", 1).await.allowed);
        for _ in 0..3 {
            limiter.report_failure("a", false).await;
        }

        let decision = limiter.wait_for_slot("a", 1, Duration::from_secs(2)).await;
        assert!(decision.allowed);
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let wait = Duration::from_millis(1000);
        assert_eq!(apply_jitter(wait, 0.0), Duration::from_millis(1000));
        assert_eq!(apply_jitter(wait, 0.5), Duration::from_millis(1125));
        assert!(apply_jitter(wait, 0.999_999) <= Duration::from_millis(1250));

        for _ in 0..100 {
            let roll = rand::rng().random_range(0.0..1.0);
            let jittered = apply_jitter(wait, roll);
            assert!(jittered >= wait && jittered <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_limiter_without_runtime_has_no_refill_task() {
        let limiter = RateLimiter::new(config(60, 60));
        assert!(limiter.refill_task.is_none());
    }

    #[tokio::test]
    async fn test_limiter_in_runtime_spawns_refill_task() {
        let limiter = RateLimiter::new(config(60, 60));
        assert!(limiter.refill_task.is_some());
        limiter.shutdown();
        assert!(limiter.acquire("a", 1).await.allowed);
    }
}
