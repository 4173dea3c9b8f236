/// Retry policy with exponential backoff and optional jitter
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Classifies an error as worth retrying or not.
///
/// Errors that cannot be fixed by trying again (malformed input, routing
/// failures) return `false` and short-circuit [`with_retry`].
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_backoff: Duration,
    /// Upper bound for a single delay
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Doubling policy: `initial_backoff`, `2 * initial_backoff`, ...
    pub fn exponential(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            ..Default::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// Pure function of the policy; sleeping is left to the caller.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base_ms = self.initial_backoff.as_millis() as f64;
        let raw_ms = base_ms * self.backoff_multiplier.powi(exponent);
        let capped_ms = raw_ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff_for(attempt);
        if self.jitter {
            let mut rng = rand::thread_rng();
            let jitter_factor = 1.0 + rng.gen_range(-0.3..0.3);
            Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
        } else {
            base
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
    #[error("Non-retryable failure: {0}")]
    Permanent(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
            RetryError::Permanent(e) => e,
        }
    }
}

/// Execute a future with retry logic
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut f: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(RetryError::Permanent(e)),
            Err(e) => {
                if !policy.should_retry(attempt) {
                    warn!("Max attempts ({}) reached: {}", policy.max_attempts, e);
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }

                let delay = policy.delay_with_jitter(attempt);
                warn!(
                    "Attempt {}/{} failed, retrying in {:?}: {}",
                    attempt, policy.max_attempts, delay, e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
