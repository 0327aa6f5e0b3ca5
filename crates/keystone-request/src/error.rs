//! # Request Errors
//!
//! Every pipeline failure carries the request that produced it. Errors are
//! `Clone` so a single failure can resolve every coalesced waiter.

use crate::request::Request;
use keystone_core::KeystoneError;
use thiserror::Error;

/// A failed request.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} [{} {}]", .request.method, .request.url)]
pub struct RequestError {
    pub kind: KeystoneError,
    pub request: Box<Request>,
}

impl RequestError {
    #[must_use]
    pub fn new(kind: KeystoneError, request: &Request) -> Self {
        Self {
            kind,
            request: Box::new(request.clone()),
        }
    }

    /// Transport failure with an optional HTTP status.
    #[must_use]
    pub fn transport(status: Option<u16>, message: impl Into<String>, request: &Request) -> Self {
        Self::new(
            KeystoneError::Transport {
                status,
                message: message.into(),
            },
            request,
        )
    }

    /// Whether a retry may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == KeystoneError::Cancelled
    }
}

impl From<RequestError> for KeystoneError {
    fn from(err: RequestError) -> Self {
        err.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_request() {
        let request = Request::get("/posts/1");
        let err = RequestError::transport(Some(503), "unavailable", &request);
        assert_eq!(
            err.to_string(),
            "Transport error (503): unavailable [GET /posts/1]"
        );
        assert!(err.is_retryable());
        assert!(!err.is_cancelled());
    }
}
