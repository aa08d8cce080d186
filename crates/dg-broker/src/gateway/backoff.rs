//! Bounded exponential backoff for gateway retries

use std::time::Duration;

use dg_core::config::BackoffConfig;

/// Exponential backoff with jitter and an attempt budget
///
/// The first attempt runs immediately; [`RetryBackoff::next_delay`]
/// returns the pause before each further attempt, or `None` once the
/// budget is spent.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempts_made: u32,
    max_attempts: u32,
}

impl RetryBackoff {
    /// Create a backoff allowing `max_attempts` attempts in total
    pub fn from_config(config: &BackoffConfig, max_attempts: u32) -> Self {
        Self {
            current: config.initial,
            max: config.max,
            multiplier: config.multiplier,
            jitter: config.jitter,
            attempts_made: 1,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Attempts started so far, counting the first
    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    /// Delay before the next attempt, or `None` if the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts_made >= self.max_attempts {
            return None;
        }
        self.attempts_made += 1;

        let delay = self.current;
        let next = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        let jitter = Duration::try_from_secs_f64(jitter_amount).unwrap_or(Duration::ZERO);
        Some(delay.saturating_add(jitter))
    }
}
