// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconnect backoff policy.
//!
//! The delay before reconnect attempt `n` (zero-based) is
//! `min(max_backoff, initial_backoff * 2^n)`, further capped by whatever is
//! left of the total budget. Once the elapsed time reaches the budget the
//! caller gives up.

use std::time::Duration;

/// Immutable reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total time budget across all attempts, in milliseconds.
    pub total_timeout_ms: u64,
    /// Delay before the first reconnect, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound for a single delay, in milliseconds.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(total_timeout_ms: u64, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            total_timeout_ms,
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    /// Uncapped-by-budget delay for the given attempt.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        next_delay(attempt, self)
    }

    /// Delay for the given attempt once `elapsed` of the budget has been
    /// spent, or `None` if the budget is exhausted.
    pub fn delay_for(&self, attempt: u32, elapsed: Duration) -> Option<Duration> {
        let budget = Duration::from_millis(self.total_timeout_ms);
        if elapsed >= budget {
            return None;
        }
        Some(self.next_delay(attempt).min(budget - elapsed))
    }

    /// The sequence of delays this policy produces when attempts themselves
    /// take no time.
    pub fn schedule(&self) -> Schedule {
        Schedule {
            policy: *self,
            attempt: 0,
            elapsed: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(60_000, 1_000, 30_000)
    }
}

/// Pure backoff function: `min(max_backoff, initial_backoff * 2^attempt)`.
pub fn next_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let shift = attempt.min(32);
    let multiplier = 1_u64 << shift;
    let calculated = policy.initial_backoff_ms.saturating_mul(multiplier);
    Duration::from_millis(calculated.min(policy.max_backoff_ms))
}

/// Iterator over the delays of a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Schedule {
    policy: RetryPolicy,
    attempt: u32,
    elapsed: Duration,
}

impl Iterator for Schedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for(self.attempt, self.elapsed)?;
        if delay.is_zero() {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        self.elapsed += delay;
        Some(delay)
    }
}
