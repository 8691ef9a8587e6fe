//! Reconnection backoff for the control channel

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Reconnection configuration.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap for the growing delay.
    pub max_delay: Duration,
    /// Growth factor applied after each wait.
    pub multiplier: f64,
    /// Maximum number of attempts (None = unlimited).
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("max reconnection attempts reached")]
    MaxAttemptsReached,
}

/// Tracks the reconnect delay: doubles on each consecutive wait, caps at
/// the configured maximum, resets on successful registration.
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            config,
            attempt: 0,
        }
    }

    /// Sleep for the current delay, then grow it.
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        debug!(
            delay_secs = self.current_delay.as_secs(),
            attempt = self.attempt,
            "Waiting before reconnection attempt"
        );

        sleep(self.current_delay).await;

        let next = Duration::from_secs_f64(
            self.current_delay.as_secs_f64() * self.config.multiplier,
        );
        self.current_delay = next.min(self.config.max_delay);

        Ok(())
    }

    /// Reset the delay after a successful registration.
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_delay = self.config.initial_delay;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
            multiplier: 2.0,
            max_attempts: None,
        }
    }

    #[tokio::test]
    async fn test_delay_doubles_and_caps() {
        let mut manager = ReconnectManager::new(quick_config());

        assert_eq!(manager.current_delay(), Duration::from_millis(5));

        manager.wait().await.unwrap();
        assert_eq!(manager.current_delay(), Duration::from_millis(10));

        manager.wait().await.unwrap();
        assert_eq!(manager.current_delay(), Duration::from_millis(20));

        manager.wait().await.unwrap();
        assert_eq!(manager.current_delay(), Duration::from_millis(40));

        // Capped at max_delay from here on.
        manager.wait().await.unwrap();
        assert_eq!(manager.current_delay(), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_reset_restores_initial_delay() {
        let mut manager = ReconnectManager::new(quick_config());

        manager.wait().await.unwrap();
        manager.wait().await.unwrap();
        assert_eq!(manager.attempt(), 2);

        manager.reset();
        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_delay(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_max_attempts() {
        let mut manager = ReconnectManager::new(ReconnectConfig {
            max_attempts: Some(2),
            ..quick_config()
        });

        assert!(manager.wait().await.is_ok());
        assert!(manager.wait().await.is_ok());
        assert!(matches!(
            manager.wait().await,
            Err(ReconnectError::MaxAttemptsReached)
        ));
    }

    #[test]
    fn test_default_policy_matches_channel_contract() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(5));
        assert_eq!(config.max_delay, Duration::from_secs(120));
        assert_eq!(config.multiplier, 2.0);
        assert!(config.max_attempts.is_none());
    }
}
