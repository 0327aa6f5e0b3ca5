//! Bearer token authentication.

use crate::document::Response;
use crate::error::RequestError;
use crate::handler::{Handler, Next};
use crate::request::Request;
use async_trait::async_trait;

/// Adds `authorization: Bearer <token>` unless the request already carries
/// an authorization header.
#[derive(Clone)]
pub struct AuthHandler {
    token: String,
}

impl AuthHandler {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for AuthHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHandler").field("token", &"<redacted>").finish()
    }
}

#[async_trait]
impl Handler for AuthHandler {
    async fn handle(&self, request: Request, next: Next) -> Result<Response, RequestError> {
        if request.headers.contains_key("authorization") {
            return next.run(request).await;
        }
        let bearer = format!("Bearer {}", self.token);
        next.run(request.header("authorization", bearer)).await
    }
}
