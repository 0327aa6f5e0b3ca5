//! # Rate Limiting
//!
//! Client-side throttle in front of the transport. Requests over the quota
//! wait for a permit rather than failing.

use crate::document::Response;
use crate::error::RequestError;
use crate::handler::{Handler, Next};
use crate::request::Request;
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Default rate limit: 100 requests per second.
pub const DEFAULT_RPS: NonZeroU32 = match NonZeroU32::new(100) {
    Some(rps) => rps,
    None => NonZeroU32::MIN,
};

/// Throttling handler. Clones share one limiter.
#[derive(Clone)]
pub struct RateLimitHandler {
    limiter: Arc<DefaultDirectRateLimiter>,
    requests_per_second: NonZeroU32,
}

impl RateLimitHandler {
    /// Create a limiter; zero falls back to [`DEFAULT_RPS`].
    #[must_use]
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(DEFAULT_RPS);
        Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
            requests_per_second: rps,
        }
    }

    #[must_use]
    pub fn requests_per_second(&self) -> u32 {
        self.requests_per_second.get()
    }
}

impl std::fmt::Debug for RateLimitHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitHandler")
            .field("requests_per_second", &self.requests_per_second)
            .finish()
    }
}

#[async_trait]
impl Handler for RateLimitHandler {
    async fn handle(&self, request: Request, next: Next) -> Result<Response, RequestError> {
        if self.limiter.check().is_err() {
            tracing::warn!(url = %request.url, "Rate limit reached, waiting for permit");
            self.limiter.until_ready().await;
        }
        next.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_defaults() {
        let handler = RateLimitHandler::new(0);
        assert_eq!(handler.requests_per_second(), 100);
        assert!(handler.limiter.check().is_ok());
    }

    #[test]
    fn quota_is_enforced() {
        let handler = RateLimitHandler::new(1);
        assert!(handler.limiter.check().is_ok());
        assert!(handler.limiter.check().is_err());
    }
}
