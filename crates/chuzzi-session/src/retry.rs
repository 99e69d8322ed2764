//! Bounded reconnect schedule.

use std::time::Duration;

use chuzzi_core::config::Config;
use chuzzi_core::error::{ChuzziError, Result};

/// What to do after the `attempt`-th consecutive connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Stateless retry schedule. The attempt counter lives with the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delays: vec![
                Duration::from_millis(1000),
                Duration::from_millis(3000),
                Duration::from_millis(5000),
            ],
        }
    }
}

impl RetryPolicy {
    /// The schedule must hold a delay for every attempt.
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Result<Self> {
        if delays.len() < max_attempts as usize {
            return Err(ChuzziError::Config(format!(
                "retry schedule has {} delays but max_attempts is {max_attempts}",
                delays.len()
            )));
        }
        Ok(Self {
            max_attempts,
            delays,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.retry().max_attempts, config.retry_delays())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retry number `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delays
            .get(attempt as usize)
            .or(self.delays.last())
            .copied()
            .unwrap_or_default()
    }

    pub fn next(&self, attempt: u32) -> RetryDecision {
        if self.should_retry(attempt) {
            RetryDecision::RetryAfter(self.delay_for(attempt))
        } else {
            RetryDecision::GiveUp
        }
    }
}
