//! # Retry
//!
//! Retries retryable failures (connection errors, 408, 429, 5xx) with
//! capped exponential backoff. Everything else is returned at once.

use crate::document::Response;
use crate::error::RequestError;
use crate::handler::{Handler, Next};
use crate::request::Request;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max_delay_ms`.
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        // 1 << 63 is the largest shift that fits in u64
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Retrying handler.
#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> RetryConfig {
        self.config
    }
}

#[async_trait]
impl Handler for RetryHandler {
    async fn handle(&self, request: Request, next: Next) -> Result<Response, RequestError> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match next.run(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.config.calculate_delay(attempt.saturating_sub(1));
                    tracing::warn!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
