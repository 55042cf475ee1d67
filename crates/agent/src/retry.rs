//! Bounded retry for individual provider calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use deckhand_core::config::GenerationConfig;

use crate::llm::LlmError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Exponential backoff for the given 1-based failed attempt, capped at
    /// `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1_u32 << exponent).min(self.max_delay)
    }

    /// Delay before the next attempt. Rate limits wait at least as long as
    /// the backend asked, even past `max_delay`.
    pub fn delay_for(&self, attempt: u32, error: &LlmError) -> Duration {
        let backoff = self.backoff(attempt);
        match error.retry_after() {
            Some(hint) => backoff.max(hint),
            None => backoff,
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is exhausted. The last error is returned.
    pub async fn run<T, F, Fut>(
        &self,
        step: &str,
        correlation_id: &str,
        mut operation: F,
    ) -> Result<T, LlmError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt, &error);
                    warn!(
                        event_name = "generation.retry_scheduled",
                        correlation_id,
                        step,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error_class = error.error_class(),
                        error = %error,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
