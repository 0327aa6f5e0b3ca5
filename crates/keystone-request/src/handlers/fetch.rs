//! # Fetch
//!
//! Terminal handler performing HTTP with `reqwest`. It never calls `next`.
//!
//! - Relative URLs are resolved against `base_url`
//! - `params` become query parameters, `body` is sent as JSON
//! - A non-2xx status becomes a `Transport` error carrying the status
//! - An empty body becomes `Value::Null`

use crate::document::Response;
use crate::error::RequestError;
use crate::handler::{Handler, Next};
use crate::request::{Method, Request};
use async_trait::async_trait;
use keystone_core::KeystoneError;
use reqwest::Url;
use serde_json::Value;
use std::collections::BTreeMap;

/// HTTP transport.
#[derive(Debug, Clone)]
pub struct FetchHandler {
    http: reqwest::Client,
    /// Always ends in `/` so relative paths extend it.
    base: Url,
}

impl FetchHandler {
    /// Create a fetcher for the API at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, KeystoneError> {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a fetcher reusing an existing client.
    pub fn with_client(http: reqwest::Client, base_url: &str) -> Result<Self, KeystoneError> {
        let mut base = Url::parse(base_url).map_err(|e| {
            KeystoneError::Config(format!("invalid base URL '{base_url}': {e}"))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { http, base })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    /// Absolute URL for a request. Relative URLs, with or without a leading
    /// `/`, extend the base path.
    pub fn resolve(&self, url: &str) -> Result<Url, KeystoneError> {
        let relative = if url.starts_with("//") {
            url
        } else {
            url.trim_start_matches('/')
        };
        self.base
            .join(relative)
            .map_err(|e| KeystoneError::Config(format!("invalid request URL '{url}': {e}")))
    }

    fn builder(&self, request: &Request) -> Result<reqwest::RequestBuilder, KeystoneError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self.http.request(method, self.resolve(&request.url)?);
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder)
    }
}

#[async_trait]
impl Handler for FetchHandler {
    async fn handle(&self, request: Request, _next: Next) -> Result<Response, RequestError> {
        tracing::debug!(method = %request.method, url = %request.url, "Fetching");

        let builder = self
            .builder(&request)
            .map_err(|kind| RequestError::new(kind, &request))?;
        let resp = builder.send().await.map_err(|e| {
            RequestError::transport(
                e.status().map(|s| s.as_u16()),
                format!("{}: {e}", self.base),
                &request,
            )
        })?;

        let status = resp.status();
        let headers: BTreeMap<String, String> = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let text = resp
            .text()
            .await
            .map_err(|e| RequestError::transport(Some(status.as_u16()), e.to_string(), &request))?;

        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), "Request rejected by server");
            return Err(RequestError::transport(Some(status.as_u16()), text, &request));
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                RequestError::new(
                    KeystoneError::Normalization(format!("invalid JSON body: {e}")),
                    &request,
                )
            })?
        };

        Ok(Response {
            status: status.as_u16(),
            headers,
            body,
        })
    }
}
