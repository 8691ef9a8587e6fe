//! Jittered exponential retry policy

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Retry behavior for dial-like operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Fractional jitter applied to each delay, e.g. 0.1 for ±10%.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// All attempts failed.
#[derive(Error, Debug)]
#[error("operation failed after {attempts} attempts: {last}")]
pub struct RetryExhausted<E: std::error::Error> {
    pub attempts: u32,
    #[source]
    pub last: E,
}

/// Run an operation until it succeeds or the policy is exhausted.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryExhausted<E>>
where
    E: std::error::Error,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = policy.initial_delay;
    let mut last_err = None;

    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying operation");
            tokio::time::sleep(jittered(delay, policy.jitter_factor)).await;

            delay = Duration::from_secs_f64(
                (delay.as_secs_f64() * policy.backoff_factor)
                    .min(policy.max_delay.as_secs_f64()),
            );
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => last_err = Some(err),
        }
    }

    Err(RetryExhausted {
        attempts: policy.max_attempts,
        last: last_err.expect("at least one attempt ran"),
    })
}

fn jittered(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return delay;
    }

    let spread = delay.as_secs_f64() * factor;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
}
