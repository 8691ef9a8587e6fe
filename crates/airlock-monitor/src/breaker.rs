//! Circuit breaker for repeated dial-like failures

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Error, Debug)]
pub enum BreakerError<E: std::error::Error> {
    #[error("circuit breaker '{0}' is open")]
    Open(String),

    #[error(transparent)]
    Inner(#[from] E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker with the classic three-state protocol.
///
/// `max_failures` consecutive failures trip the breaker open; while
/// open, calls are rejected until `reset_timeout` has elapsed since the
/// last failure, after which one probe call runs half-open. A half-open
/// success closes the breaker and resets counters; a half-open failure
/// re-opens it.
pub struct CircuitBreaker {
    name: String,
    max_failures: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            max_failures,
            reset_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Breaker with the standard thresholds: 5 failures, 30 s reset.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, 5, Duration::from_secs(30))
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().map(|inner| inner.state).unwrap_or(BreakerState::Open)
    }

    /// Run an operation under breaker protection.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn admit<E: std::error::Error>(&self) -> Result<(), BreakerError<E>> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        if inner.state == BreakerState::Open {
            let cooled_down = inner
                .last_failure
                .map(|at| at.elapsed() >= self.reset_timeout)
                .unwrap_or(true);

            if !cooled_down {
                return Err(BreakerError::Open(self.name.clone()));
            }

            inner.state = BreakerState::HalfOpen;
            tracing::info!(breaker = %self.name, "Circuit breaker half-open");
        }

        Ok(())
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        if inner.state == BreakerState::HalfOpen {
            tracing::info!(breaker = %self.name, "Circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        inner.failures += 1;
        inner.last_failure = Some(Instant::now());

        if inner.state == BreakerState::HalfOpen || inner.failures >= self.max_failures {
            if inner.state != BreakerState::Open {
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.failures,
                    "Circuit breaker opened"
                );
            }
            inner.state = BreakerState::Open;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("dial failed")]
    struct DialError;

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<DialError>> {
        breaker.call(|| async { Err::<(), _>(DialError) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<DialError>> {
        breaker.call(|| async { Ok::<(), DialError>(()) }).await
    }

    #[tokio::test]
    async fn test_breaker_trips_after_threshold() {
        let breaker = CircuitBreaker::new("dial", 3, Duration::from_secs(30));

        for _ in 0..2 {
            assert!(matches!(
                fail(&breaker).await,
                Err(BreakerError::Inner(_))
            ));
            assert_eq!(breaker.state(), BreakerState::Closed);
        }

        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);

        // While open, calls are rejected without running.
        assert!(matches!(
            succeed(&breaker).await,
            Err(BreakerError::Open(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_half_open_recovery() {
        let breaker = CircuitBreaker::new("dial", 1, Duration::from_secs(30));

        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;

        // First call after the reset timeout runs half-open and closes
        // the breaker on success.
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("dial", 1, Duration::from_secs(30));

        assert!(fail(&breaker).await.is_err());
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(matches!(
            fail(&breaker).await,
            Err(BreakerError::Inner(_))
        ));
        assert_eq!(breaker.state(), BreakerState::Open);

        // And it stays open until the next cooldown.
        assert!(matches!(
            succeed(&breaker).await,
            Err(BreakerError::Open(_))
        ));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("dial", 3, Duration::from_secs(30));

        assert!(fail(&breaker).await.is_err());
        assert!(fail(&breaker).await.is_err());
        assert!(succeed(&breaker).await.is_ok());

        // The streak restarts: two more failures do not trip it.
        assert!(fail(&breaker).await.is_err());
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
