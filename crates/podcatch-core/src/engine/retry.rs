//! Retry policy - exponential backoff with jitter and `Retry-After` hints

use crate::error::DownloadError;
use chrono::{DateTime, Utc};
use podcatch_types::Settings;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How often and how patiently a job is retried
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random extra delay, as a fraction of the computed backoff
    pub jitter: f64,
    /// Upper clamp on server hints
    pub max_retry_after: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            max_delay: Duration::from_millis(settings.retry_max_delay_ms),
            jitter: settings.retry_jitter.max(0.0),
            max_retry_after: Duration::from_millis(settings.max_retry_after_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff after the `attempt`-th failure (1-based): doubles each time,
    /// plus jitter, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let base = self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        let jitter = if self.jitter > 0.0 {
            base.mul_f64(rand::rng().random_range(0.0..self.jitter))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.max_delay)
    }

    /// Delay before retrying after `error`; a server hint wins over backoff
    pub fn delay_for(&self, attempt: u32, error: &DownloadError) -> Duration {
        match error.retry_after() {
            Some(hint) => hint.min(self.max_retry_after),
            None => self.backoff(attempt),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Run `attempt_fn` until it succeeds, fails for good, or the budget is spent.
///
/// Non-retryable errors and cancellation are returned as they are. Running
/// out of attempts yields [`DownloadError::RetriesExhausted`] carrying the
/// last error's kind and message. Delays between attempts end early when
/// `cancel` fires.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt_fn: F,
) -> Result<T, DownloadError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DownloadError>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(DownloadError::Canceled);
        }

        let error = match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !error.is_retryable() {
            return Err(error);
        }
        if attempt >= max_attempts {
            return Err(DownloadError::RetriesExhausted {
                attempts: attempt,
                kind: error.kind(),
                message: error.to_string(),
            });
        }

        let delay = policy.delay_for(attempt, &error);
        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            attempt, max_attempts, error, delay
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Canceled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
