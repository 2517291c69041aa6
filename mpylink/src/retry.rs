//! Bounded retry with exponential backoff.

use crate::channel::{Command, CommandChannel, CommandResponse};
use crate::error::{Error, Result};
use log::warn;
use std::thread;
use std::time::Duration;

/// Default number of attempts (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Retry policy for transport failures.
///
/// Only errors with [`Error::is_retryable`] are retried. The delay before
/// retry `n` (1-based) is `base_delay * 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Set the number of attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry
            .saturating_sub(1)
            .min(16);
        self.base_delay
            .saturating_mul(1 << shift)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error or
    /// runs out of attempts. `op` receives the 1-based attempt number.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(if attempts == 1 {
                        e
                    } else {
                        Error::RetriesExhausted {
                            attempts,
                            source: Box::new(e),
                        }
                    });
                },
                Err(e) => {
                    let delay = self.backoff(attempt);
                    warn!("{operation} attempt {attempt}/{attempts} failed: {e}, retrying in {delay:?}");
                    thread::sleep(delay);
                    attempt += 1;
                },
            }
        }
    }

    /// Send `cmd` on `channel` under this policy.
    pub fn send_with_retry(
        &self,
        channel: &CommandChannel,
        cmd: &Command,
    ) -> Result<CommandResponse> {
        self.run(cmd.code().name(), |_| channel.send_command(cmd))
    }
}
