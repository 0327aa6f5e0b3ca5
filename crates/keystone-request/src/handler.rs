//! # Handler Chain
//!
//! Handlers form an ordered list. Each receives the request and a `Next`
//! continuation pointing at the rest of the list; it may call `next.run`
//! zero times (answering itself), once, or several times (retrying).
//!
//! The last handler is expected to be a terminal one that performs I/O.
//! Running off the end of the list is an error, not a hang.

use crate::document::Response;
use crate::error::RequestError;
use crate::request::Request;
use async_trait::async_trait;
use keystone_core::KeystoneError;
use std::sync::Arc;

/// One step of the request pipeline.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request, next: Next) -> Result<Response, RequestError>;
}

/// Continuation into the remaining handlers.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[Arc<dyn Handler>]>,
    index: usize,
}

impl Next {
    pub(crate) fn new(chain: Arc<[Arc<dyn Handler>]>) -> Self {
        Self { chain, index: 0 }
    }

    /// Run the rest of the chain.
    pub async fn run(&self, request: Request) -> Result<Response, RequestError> {
        let Some(handler) = self.chain.get(self.index) else {
            return Err(RequestError::new(
                KeystoneError::Config("handler chain ended without a response".to_string()),
                &request,
            ));
        };
        let next = Self {
            chain: Arc::clone(&self.chain),
            index: self.index.saturating_add(1),
        };
        handler.handle(request, next).await
    }

    /// Number of handlers still ahead.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.chain.len().saturating_sub(self.index)
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Tag(&'static str);

    #[async_trait]
    impl Handler for Tag {
        async fn handle(&self, request: Request, next: Next) -> Result<Response, RequestError> {
            let mut response = next.run(request.header("x-trace", self.0)).await?;
            response.headers.insert(format!("x-seen-{}", self.0), "1".into());
            Ok(response)
        }
    }

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, request: Request, _next: Next) -> Result<Response, RequestError> {
            Ok(Response::ok(json!({ "trace": request.headers.get("x-trace") })))
        }
    }

    #[tokio::test]
    async fn runs_in_order_and_unwinds() {
        let handlers: Vec<Arc<dyn Handler>> =
            vec![Arc::new(Tag("a")), Arc::new(Tag("b")), Arc::new(Echo)];
        let response = Next::new(Arc::from(handlers))
            .run(Request::get("/posts"))
            .await
            .expect("response");
        // The innermost tag wins the header, both see the response.
        assert_eq!(response.body, json!({"trace": "b"}));
        assert!(response.headers.contains_key("x-seen-a"));
        assert!(response.headers.contains_key("x-seen-b"));
    }

    #[tokio::test]
    async fn empty_chain_is_an_error() {
        let chain: Arc<[Arc<dyn Handler>]> = Arc::from(Vec::<Arc<dyn Handler>>::new());
        let result = Next::new(chain).run(Request::get("/posts")).await;
        assert!(matches!(
            result,
            Err(RequestError {
                kind: KeystoneError::Config(_),
                ..
            })
        ));
    }
}
