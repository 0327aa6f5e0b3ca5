//! # Handlers
//!
//! Stock handlers for the pipeline. A typical chain, outermost first:
//!
//! ```text
//! AuthHandler -> RetryHandler -> RateLimitHandler -> FetchHandler
//! ```
//!
//! Rate limiting sits inside retry so that every attempt is metered.

mod auth;
mod fetch;
mod rate_limit;
mod retry;

pub use auth::AuthHandler;
pub use fetch::FetchHandler;
pub use rate_limit::{DEFAULT_RPS, RateLimitHandler};
pub use retry::{RetryConfig, RetryHandler};
