//! Retry policy for archive submissions.
//!
//! Delays grow exponentially from `initial_backoff` with a random positive offset, capped
//! at `max_backoff`: for the `i`-th retry the wait is
//! `min(max_backoff, 2^i * initial_backoff + rand_i)`, where `rand_i` is at most
//! `min(initial_backoff, 1s)`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::num::Saturating;
use std::time::Duration;

use crate::config::RetryConfig;

/// Upper bound of the random offset added to each delay.
const MAX_JITTER: Duration = Duration::from_secs(1);

/// How often, and how patiently, a failed submission is retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry (before jitter).
    pub initial_backoff: Duration,
    /// Ceiling for any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        }
    }
}

impl RetryPolicy {
    /// Delays to wait between attempts, `max_attempts - 1` of them.
    pub fn backoff(&self) -> ExponentialBackoff<StdRng> {
        ExponentialBackoff::new_with_rng(self, StdRng::from_entropy())
    }

    /// Like [`RetryPolicy::backoff`] with a fixed seed, for reproducible delays.
    pub fn backoff_with_seed(&self, seed: u64) -> ExponentialBackoff<StdRng> {
        ExponentialBackoff::new_with_rng(self, StdRng::seed_from_u64(seed))
    }
}

/// Iterator over exponential wait durations.
#[derive(Debug)]
pub struct ExponentialBackoff<R> {
    min_backoff: Duration,
    max_backoff: Duration,
    max_jitter: Duration,
    sequence_index: u32,
    max_retries: u32,
    rng: R,
}

impl<R: Rng> ExponentialBackoff<R> {
    /// Build the delay sequence for `policy` drawing jitter from `rng`.
    pub fn new_with_rng(policy: &RetryPolicy, rng: R) -> Self {
        Self {
            min_backoff: policy.initial_backoff,
            max_backoff: policy.max_backoff,
            max_jitter: policy.initial_backoff.min(MAX_JITTER),
            sequence_index: 0,
            max_retries: policy.max_attempts.saturating_sub(1),
            rng,
        }
    }

    fn random_offset(&mut self) -> Duration {
        let micros = u64::try_from(self.max_jitter.as_micros()).unwrap_or(u64::MAX);
        Duration::from_micros(self.rng.gen_range(0..=micros))
    }
}

impl<R: Rng> Iterator for ExponentialBackoff<R> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.sequence_index >= self.max_retries {
            return None;
        }
        let delay = self
            .min_backoff
            .saturating_mul(Saturating(2u32).pow(self.sequence_index).0)
            .saturating_add(self.random_offset())
            .min(self.max_backoff);
        self.sequence_index = self.sequence_index.saturating_add(1);
        Some(delay)
    }
}
