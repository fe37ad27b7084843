// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Exponential backoff shared by the connection manager and the supervisor.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with an upper bound and optional jitter.
///
/// The delay before attempt `n` (1-based) is `base * 2^(n-1)`, capped at `cap`.
/// With jitter enabled the delay is drawn uniformly from `[delay / 2, delay]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: bool) -> Backoff {
        Backoff {
            base,
            cap: cap.max(base),
            jitter,
        }
    }

    /// Delay to wait before retry number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap);

        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let half = delay / 2;
        rand::thread_rng().gen_range(half..=delay)
    }
}
