use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Classify, ErrorKind};

/// Bounded retry with exponential backoff for one external-call site.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retryable: BTreeSet<ErrorKind>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        retryable: impl IntoIterator<Item = ErrorKind>,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            retryable: retryable.into_iter().collect(),
        }
    }

    /// One attempt, nothing retryable.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, [])
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Delay slept after failed attempt `attempt` (1-based):
    /// `base_delay * 2^(attempt-1)`, clamped to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable kind, or
    /// attempts are exhausted. The last attempt's error is returned.
    pub fn run<T, E, F>(&self, site: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Classify + std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(site, attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let kind = err.kind();
                    if !self.is_retryable(kind) {
                        return Err(err);
                    }
                    if attempt >= self.max_attempts {
                        tracing::warn!(
                            site,
                            attempts = attempt,
                            error = %err,
                            "Retry attempts exhausted"
                        );
                        return Err(err);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        site,
                        attempt,
                        ?kind,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retryable failure, backing off"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().to_policy()
    }
}

/// Serializable form of a [`RetryPolicy`] (delays in milliseconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub retryable: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            retryable: vec![ErrorKind::Connection, ErrorKind::Timeout],
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.retryable.iter().copied(),
        )
    }
}
