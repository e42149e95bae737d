//! Token-bucket throttling for SSD bandwidth.
//!
//! One bucket per direction, refilled at the configured MiB/s with capacity
//! equal to one second of budget. A request that cannot be fully satisfied
//! is refused rather than queued; a zero rate disables the direction.

use std::time::Instant;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug)]
pub struct TokenBucket {
    rate_bytes_per_s: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket refilling at `mb_s` MiB per second, starting full.
    pub fn new(mb_s: usize) -> Self {
        let rate = mb_s as f64 * MIB;
        Self {
            rate_bytes_per_s: rate,
            tokens: rate,
            last_refill: Instant::now(),
        }
    }

    pub fn refill(&mut self, now: Instant) {
        let dt = now.duration_since(self.last_refill).as_secs_f64();
        if dt <= 0.0 {
            return;
        }
        self.tokens = (self.tokens + self.rate_bytes_per_s * dt).min(self.rate_bytes_per_s);
        self.last_refill = now;
    }

    /// Take `bytes` from the bucket, or refuse the whole request.
    pub fn try_consume(&mut self, bytes: usize) -> bool {
        if self.rate_bytes_per_s == 0.0 {
            return false;
        }
        let need = bytes as f64;
        if self.tokens < need {
            return false;
        }
        self.tokens -= need;
        true
    }
}
