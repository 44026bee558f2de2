// src/middleware/bucket.rs
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lock-free token bucket. Allows bursts up to `burst` while limiting the
/// sustained rate to `per_second` tokens per second.
///
/// Tokens are stored fixed-point (milli-tokens) so fractional refill amounts
/// survive atomic arithmetic.
#[derive(Debug)]
pub struct TokenBucket {
    burst: u64,
    per_second: f64,
    tokens_millis: AtomicU64,
    last_refill_nanos: AtomicU64,
    created_at: Instant,
}

impl TokenBucket {
    pub fn new(burst: u64, per_second: f64) -> Self {
        Self {
            burst,
            per_second,
            tokens_millis: AtomicU64::new(burst * 1000),
            last_refill_nanos: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    /// Take one token. Returns false when the bucket is dry.
    pub fn try_consume(&self) -> bool {
        self.refill();

        loop {
            let current = self.tokens_millis.load(Ordering::Acquire);
            if current < 1000 {
                return false;
            }

            match self.tokens_millis.compare_exchange_weak(
                current,
                current - 1000,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    pub fn available(&self) -> f64 {
        self.refill();
        self.tokens_millis.load(Ordering::Acquire) as f64 / 1000.0
    }

    fn refill(&self) {
        let now_nanos = self.created_at.elapsed().as_nanos() as u64;
        let last_nanos = self.last_refill_nanos.load(Ordering::Acquire);

        if now_nanos <= last_nanos {
            return;
        }

        let elapsed_secs = (now_nanos - last_nanos) as f64 / 1_000_000_000.0;
        let tokens_to_add = (elapsed_secs * self.per_second * 1000.0) as u64;

        if tokens_to_add == 0 {
            return;
        }

        // One thread wins the refill; losers see the updated timestamp.
        if self
            .last_refill_nanos
            .compare_exchange(last_nanos, now_nanos, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let max_millis = self.burst * 1000;
        loop {
            let current = self.tokens_millis.load(Ordering::Acquire);
            let new_value = (current + tokens_to_add).min(max_millis);

            if current == new_value {
                break;
            }

            match self.tokens_millis.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn allows_burst_then_refuses() {
        let bucket = TokenBucket::new(5, 1.0);

        for _ in 0..5 {
            assert!(bucket.try_consume());
        }
        assert!(!bucket.try_consume());
    }

    #[test]
    fn refills_over_time() {
        let bucket = TokenBucket::new(2, 100.0);

        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());

        std::thread::sleep(Duration::from_millis(50));
        assert!(bucket.try_consume());
    }

    #[test]
    fn never_exceeds_burst() {
        let bucket = TokenBucket::new(3, 1000.0);
        std::thread::sleep(Duration::from_millis(20));
        assert!(bucket.available() <= 3.0);
    }

    #[test]
    fn concurrent_consumers_stay_within_budget() {
        use std::sync::Arc;

        let bucket = Arc::new(TokenBucket::new(100, 0.0001));
        let mut handles = vec![];

        for _ in 0..8 {
            let bucket = Arc::clone(&bucket);
            handles.push(std::thread::spawn(move || {
                let mut consumed = 0u64;
                for _ in 0..50 {
                    if bucket.try_consume() {
                        consumed += 1;
                    }
                }
                consumed
            }));
        }

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total <= 100, "consumed {total} tokens from a burst of 100");
    }

    proptest! {
        #[test]
        fn available_is_bounded_by_burst(burst in 1u64..1000, rate in 0.1f64..1000.0) {
            let bucket = TokenBucket::new(burst, rate);
            prop_assert!(bucket.available() <= burst as f64);
            bucket.try_consume();
            prop_assert!(bucket.available() <= burst as f64);
        }
    }
}
