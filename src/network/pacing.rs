//! Token-bucket pacing of PCM transmission
//!
//! Tokens are sample frames. The bucket refills in whole intervals at the
//! stream's nominal sample rate, so a sender that spends one token per
//! transmitted sample frame tracks real-time playback. After a stall longer
//! than one full refill cycle the bucket is reset to capacity instead of
//! crediting the whole gap, which would otherwise replay the stall as a
//! burst.
//!
//! Time is passed in explicitly so the bucket can be driven by a simulated
//! clock in tests.

use std::time::{Duration, Instant};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Sample-frame credit for one sender thread.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: u64,
    capacity: u64,
    sample_rate: u32,
    interval: Duration,
    /// Sub-token credit carried between refills, in token-nanoseconds
    fraction: u128,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket for `sample_rate`, refilled every `interval` and holding up
    /// to `burst_intervals` intervals of credit. Starts empty.
    pub fn new(sample_rate: u32, interval: Duration, burst_intervals: u32, now: Instant) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let mut bucket = Self {
            tokens: 0,
            capacity: 0,
            sample_rate,
            interval,
            fraction: 0,
            last_refill: now,
        };
        bucket.capacity = bucket.refill_tokens() * burst_intervals.max(1) as u64;
        bucket
    }

    /// Whole tokens credited per refill interval at the current rate
    pub fn refill_tokens(&self) -> u64 {
        ((self.interval.as_nanos() * self.sample_rate as u128) / NANOS_PER_SEC).max(1) as u64
    }

    /// Time needed to fill the bucket from empty
    pub fn full_cycle(&self) -> Duration {
        let intervals = self.capacity.div_ceil(self.refill_tokens()).max(1);
        self.interval * intervals as u32
    }

    /// Credit whole elapsed intervals since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed < self.interval {
            return;
        }

        if elapsed > self.full_cycle() {
            self.tokens = self.capacity;
            self.fraction = 0;
            self.last_refill = now;
            return;
        }

        let intervals = elapsed.as_nanos() / self.interval.as_nanos();
        let credit = intervals * self.interval.as_nanos() * self.sample_rate as u128 + self.fraction;
        self.fraction = credit % NANOS_PER_SEC;
        let added = (credit / NANOS_PER_SEC) as u64;

        self.tokens = self.tokens.saturating_add(added).min(self.capacity);
        self.last_refill += self.interval * intervals as u32;
    }

    /// Spend `samples` tokens if that many are available.
    pub fn try_consume(&mut self, samples: u64) -> bool {
        if self.tokens < samples {
            return false;
        }
        self.tokens -= samples;
        true
    }

    /// Switch to a new nominal rate, keeping the burst length in intervals.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if sample_rate == self.sample_rate || sample_rate == 0 {
            return;
        }
        let burst_intervals = (self.capacity / self.refill_tokens()).max(1);
        self.sample_rate = sample_rate;
        self.fraction = 0;
        self.capacity = self.refill_tokens() * burst_intervals;
        self.tokens = self.tokens.min(self.capacity);
    }

    /// Grow capacity so a request of `samples` can ever be satisfied.
    pub fn ensure_capacity(&mut self, samples: u64) {
        if samples > self.capacity {
            self.capacity = samples;
        }
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
