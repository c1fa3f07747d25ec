use std::time::{Duration, Instant};

/// Token bucket bounding new sampling decisions per second.
///
/// Capacity equals the per-second rate, so at most one second worth of
/// decisions can burst after an idle period.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(per_second: u32, now: Instant) -> Self {
        let capacity = f64::from(per_second.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_second: capacity,
            last_refill: now,
        }
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_second)
            .min(self.capacity);
        self.last_refill = now;
    }
}

const MINUTE: Duration = Duration::from_secs(60);

/// Fixed one-minute window counter for per-rule budgets
#[derive(Debug)]
pub struct MinuteWindow {
    limit: u32,
    used: u32,
    window_start: Instant,
}

impl MinuteWindow {
    pub fn new(limit: u32, now: Instant) -> Self {
        Self {
            limit,
            used: 0,
            window_start: now,
        }
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) >= MINUTE {
            self.window_start = now;
            self.used = 0;
        }
        if self.used < self.limit {
            self.used += 1;
            true
        } else {
            false
        }
    }
}
