use std::time::Duration;

use rand::Rng;

use crate::settings::RetrySettings;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait for the given delay, then try again.
    Retry(Duration),
    /// The attempt cap is reached.
    GiveUp,
}

/// Bounded exponential backoff with jitter.
///
/// The `n`-th retry waits `min(initial_delay * multiplier^(n-1), max_delay)`, randomized by
/// `± jitter` of itself and capped at `max_delay` again. After `max_attempts` failed attempts the
/// policy gives up for good.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    settings: RetrySettings,
    failures: u32,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            failures: 0,
        }
    }

    /// The number of failed attempts so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.settings.max_attempts
    }

    /// The delay before the `retry`-th retry, without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.settings.initial_delay as f64 * self.settings.multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.settings.max_delay as f64) as u64)
    }

    /// Records a failed attempt.
    pub fn on_failure(&mut self) -> Backoff {
        self.on_failure_with(&mut rand::thread_rng())
    }

    /// Records a failed attempt, drawing the jitter from `rng`.
    pub fn on_failure_with<R: Rng>(&mut self, rng: &mut R) -> Backoff {
        self.failures = self.failures.saturating_add(1);
        if self.is_exhausted() {
            return Backoff::GiveUp;
        }
        let base = self.base_delay(self.failures).as_millis() as f64;
        let jitter = self.settings.jitter;
        let factor = if jitter > 0. {
            1. + rng.gen_range(-jitter..=jitter)
        } else {
            1.
        };
        let delay = (base * factor).max(0.).min(self.settings.max_delay as f64);
        Backoff::Retry(Duration::from_millis(delay as u64))
    }
}
