//! # Keystone Request
//!
//! The async request pipeline in front of a `keystone_core::Store`.
//!
//! ## Components
//!
//! - **Request**: declarative descriptor with a deterministic [`RequestKey`]
//! - **Handler**: composable chain step; [`handlers`] holds the stock ones
//! - **Pipeline**: coalescing, request caching, normalization, invalidation
//!   and cancellation
//! - **Document**: the normalized result handed back to callers
//!
//! ## Example
//!
//! ```no_run
//! use keystone_core::{Schema, Store};
//! use keystone_request::handlers::{FetchHandler, RetryHandler};
//! use keystone_request::{Pipeline, Request};
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//!
//! # async fn demo(schema: Schema) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RwLock::new(Store::new(schema)?));
//! let pipeline = Pipeline::builder()
//!     .handler(RetryHandler::default())
//!     .handler(FetchHandler::new("https://api.example.com")?)
//!     .build(store);
//!
//! let document = pipeline.request(Request::get("/posts").param("include", "author")).await?;
//! println!("{} posts", document.keys().len());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod document;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod pipeline;
pub mod request;

pub use cache::{CachePolicy, Cacheable, Freshness, RequestCache};
pub use document::{Document, Response, ResponseMeta};
pub use error::RequestError;
pub use handler::{Handler, Next};
pub use pipeline::{Pipeline, PipelineBuilder, RequestHandle, SharedStore};
pub use request::{CacheOptions, Method, RecordTarget, Request, RequestKey};
