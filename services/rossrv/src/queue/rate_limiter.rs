//! Token bucket rate limiting for dispatch
//!
//! One bucket gates the whole dispatch path: `commands_per_second` refill
//! with a `burst_size` ceiling. The dispatcher asks for one token per
//! command and stops draining lanes when the bucket runs dry; queued work
//! simply waits for the next tick.

use std::sync::Mutex;
use std::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(refill_per_sec: u32, capacity: u32) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: f64::from(refill_per_sec.max(1)),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_n(1.0)
    }

    pub fn try_acquire_n(&self, n: f64) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> f64 {
        let Ok(mut state) = self.state.lock() else {
            return 0.0;
        };
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_empty() {
        let bucket = TokenBucket::new(10, 3);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_refills_over_time() {
        let bucket = TokenBucket::new(1000, 5);
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        std::thread::sleep(Duration::from_millis(20));
        // 1000/s for 20ms is ~20 tokens, clamped to capacity 5
        assert!(bucket.try_acquire());
        assert!(bucket.available() <= 5.0);
    }

    #[test]
    fn test_capacity_clamps_refill() {
        let bucket = TokenBucket::new(1_000_000, 2);
        std::thread::sleep(Duration::from_millis(5));
        assert!(bucket.available() <= 2.0);
    }
}
