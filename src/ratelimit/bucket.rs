use std::time::{Duration, Instant};

/// Fixed-capacity counter replenished continuously at a fixed rate.
///
/// Tokens stay within `0..=capacity`. Refill only ever adds tokens, based on
/// monotonic time elapsed since the previous refill.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket refilling `per_minute` tokens every minute
    pub fn per_minute(per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from(per_minute);
        Self {
            tokens: capacity,
            capacity,
            refill_rate_per_sec: capacity / 60.0,
            last_refill: now,
        }
    }

    pub fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = (now - self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    pub fn has(&self, cost: f64) -> bool {
        self.tokens >= cost
    }

    /// Caller must have checked `has(cost)`
    pub fn take(&mut self, cost: f64) {
        self.tokens = (self.tokens - cost).max(0.0);
    }

    /// Time until `cost` tokens are available, rounded up to whole milliseconds
    pub fn wait_for(&self, cost: f64) -> Duration {
        let missing = cost - self.tokens;
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        let millis = (missing / self.refill_rate_per_sec * 1000.0).ceil();
        Duration::from_millis(millis as u64)
    }

    pub fn fill(&mut self, now: Instant) {
        self.tokens = self.capacity;
        self.last_refill = now;
    }

    pub fn drain(&mut self) {
        self.tokens = 0.0;
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn available(&self) -> u64 {
        self.tokens.floor() as u64
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::per_minute(60, start);
        bucket.take(10.0);
        assert_eq!(bucket.available(), 50);

        bucket.refill(start + Duration::from_secs(5));
        assert_eq!(bucket.available(), 55);

        bucket.refill(start + Duration::from_secs(600));
        assert_eq!(bucket.tokens(), 60.0);
    }

    #[test]
    fn test_refill_never_moves_backwards() {
        let start = Instant::now();
        let mut bucket = TokenBucket::per_minute(60, start + Duration::from_secs(1));
        bucket.drain();
        bucket.refill(start);
        assert_eq!(bucket.tokens(), 0.0);

        // A stale timestamp must not rewind the refill clock either
        bucket.refill(start + Duration::from_secs(2));
        assert_eq!(bucket.tokens(), 1.0);
    }

    #[test]
    fn test_wait_for_rounds_up_to_milliseconds() {
        let start = Instant::now();
        let mut bucket = TokenBucket::per_minute(60, start);
        bucket.drain();
        assert_eq!(bucket.wait_for(1.0), Duration::from_millis(1000));
        assert_eq!(bucket.wait_for(2.5), Duration::from_millis(2500));

        let mut slow = TokenBucket::per_minute(7, start);
        slow.drain();
        // 60 / 7 seconds = 8571.43 ms
        assert_eq!(slow.wait_for(1.0), Duration::from_millis(8572));

        bucket.fill(start);
        assert_eq!(bucket.wait_for(1.0), Duration::ZERO);
    }
}
