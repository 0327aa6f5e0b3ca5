//! # Documents
//!
//! `Response` is what handlers pass back up the chain. `Document` is what the
//! pipeline hands to callers once the response body has been normalized.

use crate::request::Request;
use keystone_core::{DocumentContent, DocumentLinks, Link, PushOutcome, RequestId, ResourceKey};
use serde_json::Value;
use std::collections::BTreeMap;

/// Raw result of the handler chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body; `Null` for an empty body.
    pub body: Value,
}

impl Response {
    /// A `200 OK` response with no headers.
    #[must_use]
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Response metadata kept on a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
}

/// Result envelope of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub content: DocumentContent,
    pub included: Vec<ResourceKey>,
    pub meta: Option<Value>,
    pub links: DocumentLinks,
    pub request: Request,
    pub response: ResponseMeta,
    /// Id the store recorded on the normalized records.
    pub request_id: Option<RequestId>,
}

impl Document {
    /// Build a document from a normalization outcome.
    #[must_use]
    pub fn from_outcome(
        request: Request,
        response: ResponseMeta,
        outcome: PushOutcome,
        request_id: RequestId,
    ) -> Self {
        Self {
            content: outcome.content,
            included: outcome.included,
            meta: outcome.meta,
            links: outcome.links.unwrap_or_default(),
            request,
            response,
            request_id: Some(request_id),
        }
    }

    /// A document for a response without a body.
    #[must_use]
    pub fn empty(request: Request, response: ResponseMeta) -> Self {
        Self {
            content: DocumentContent::Absent,
            included: Vec::new(),
            meta: None,
            links: DocumentLinks::default(),
            request,
            response,
            request_id: None,
        }
    }

    /// Primary resource keys.
    #[must_use]
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.content.keys()
    }

    #[must_use]
    pub fn next_link(&self) -> Option<&str> {
        self.links.next.as_ref().map(Link::href)
    }

    #[must_use]
    pub fn prev_link(&self) -> Option<&str> {
        self.links.prev.as_ref().map(Link::href)
    }

    #[must_use]
    pub fn first_link(&self) -> Option<&str> {
        self.links.first.as_ref().map(Link::href)
    }

    #[must_use]
    pub fn last_link(&self) -> Option<&str> {
        self.links.last.as_ref().map(Link::href)
    }

    #[must_use]
    pub fn self_link(&self) -> Option<&str> {
        self.links.self_link.as_ref().map(Link::href)
    }
}
