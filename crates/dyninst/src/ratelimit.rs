#![forbid(unsafe_code)]

//! Rate limiting for log output.
//!
//! Engines hold their own limiter and downgrade a message to a lower level
//! when the limiter denies it, so a sustained failure cannot flood the log.

use std::time::{Duration, Instant};

pub trait LogLimiter: Send {
    /// Whether the next message may be emitted at its full level.
    fn allow(&mut self) -> bool;
}

/// Token bucket holding up to `burst` tokens and regaining one every
/// `period`. Starts full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    period: Duration,
    burst: u32,
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(period: Duration, burst: u32) -> Self {
        Self::starting_at(period, burst, Instant::now())
    }

    pub fn starting_at(period: Duration, burst: u32, now: Instant) -> Self {
        Self {
            period,
            burst,
            tokens: burst,
            last_refill: now,
        }
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let period = self.period.as_nanos().max(1);
        let earned = elapsed.as_nanos() / period;
        if earned == 0 {
            return;
        }
        let tokens = u128::from(self.tokens) + earned;
        if tokens >= u128::from(self.burst) {
            self.tokens = self.burst;
            self.last_refill = now;
        } else {
            // earned < burst here, so the cast is lossless.
            let earned = earned as u32;
            self.tokens = tokens as u32;
            self.last_refill += self.period * earned;
        }
    }
}

impl LogLimiter for TokenBucket {
    fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }
}
