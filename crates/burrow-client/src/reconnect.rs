//! Reconnection with exponential backoff

use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Tracks the delay before the next attempt to reach the relay
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleep for the current backoff, then grow it. Returns early with
    /// `Cancelled` when `cancel` fires.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        debug!(
            "Waiting {:?} before reconnection attempt {}",
            self.current_backoff, self.attempt
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            _ = tokio::time::sleep(self.current_backoff) => {}
        }

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        Ok(())
    }

    /// Call after a session was established
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting reconnection backoff");
        }
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_up_to_a_minute() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(ReconnectConfig::default());

        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(manager.current_backoff().as_secs());
            manager.wait(&cancel).await.unwrap();
        }

        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(manager.attempt(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(ReconnectConfig::default());

        manager.wait(&cancel).await.unwrap();
        manager.wait(&cancel).await.unwrap();
        assert_eq!(manager.current_backoff(), Duration::from_secs(4));

        manager.reset();

        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(ReconnectConfig {
            max_attempts: Some(2),
            ..Default::default()
        });

        assert!(manager.wait(&cancel).await.is_ok());
        assert!(manager.wait(&cancel).await.is_ok());
        assert!(matches!(
            manager.wait(&cancel).await,
            Err(ReconnectError::MaxAttemptsReached)
        ));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(ReconnectConfig {
            initial_backoff: Duration::from_secs(3600),
            ..Default::default()
        });

        cancel.cancel();
        assert!(matches!(
            manager.wait(&cancel).await,
            Err(ReconnectError::Cancelled)
        ));
    }
}
