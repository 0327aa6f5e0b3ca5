//! # Pipeline
//!
//! Turns a `Request` into a `Document`:
//!
//! 1. Cacheable requests are served from the request cache when fresh
//! 2. Identical cacheable requests already in flight share one execution
//! 3. Otherwise the handler chain runs and the response body is normalized
//!    into the store inside a single store transaction
//! 4. Successful mutations mark stale every cached document that contains
//!    a resource type the mutation touched
//!
//! Execution is spawned onto the tokio runtime, so a request completes (and
//! leaves the in-flight table) even if every caller stops waiting. Outside a
//! runtime `submit` resolves to a `Config` error instead of starting one.
//!
//! A request with a `target` drives that record's state: `loading` before
//! the chain runs, `loaded` when the response carries it, `error` when the
//! request fails, is cancelled or answers without it.
//!
//! The store write guard is taken only for the synchronous normalization
//! step, never across handler I/O. Subscriber callbacks run under that
//! guard and must not lock the store themselves.

use crate::cache::{CachePolicy, Cacheable, Freshness, RequestCache};
use crate::document::{Document, Response, ResponseMeta};
use crate::error::RequestError;
use crate::handler::{Handler, Next};
use crate::request::{Request, RequestKey};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use keystone_core::{ChangeKind, KeystoneError, RecordState, RequestId, ResourceKey, Store};
use std::collections::{BTreeMap, BTreeSet};
use std::future::IntoFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{RwLock, watch};
use tokio::time::Instant;

type SharedResult = Shared<BoxFuture<'static, Result<Document, RequestError>>>;

/// Store shared between a pipeline and its callers.
pub type SharedStore = Arc<RwLock<Store>>;

// =============================================================================
// BUILDER
// =============================================================================

/// Assembles a pipeline from handlers, outermost first.
#[derive(Default)]
pub struct PipelineBuilder {
    handlers: Vec<Arc<dyn Handler>>,
    policy: CachePolicy,
}

impl PipelineBuilder {
    /// Append a handler. The terminal handler goes last.
    #[must_use]
    pub fn handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Append an already shared handler.
    #[must_use]
    pub fn shared_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    #[must_use]
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn build(self, store: SharedStore) -> Pipeline {
        tracing::debug!(handlers = self.handlers.len(), "Building request pipeline");
        Pipeline {
            inner: Arc::new(Inner {
                chain: Arc::from(self.handlers),
                store,
                in_flight: Mutex::new(BTreeMap::new()),
                cache: Mutex::new(RequestCache::new(self.policy)),
            }),
        }
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

struct InFlight {
    future: SharedResult,
    cancel: Arc<watch::Sender<bool>>,
}

struct Inner {
    chain: Arc<[Arc<dyn Handler>]>,
    store: SharedStore,
    in_flight: Mutex<BTreeMap<RequestKey, InFlight>>,
    cache: Mutex<RequestCache>,
}

/// The request pipeline. Cloning shares the same cache and in-flight table.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.inner.chain.len())
            .field("in_flight", &self.in_flight())
            .field("cached", &self.cached_count())
            .finish()
    }
}

impl Pipeline {
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// The store this pipeline normalizes into.
    #[must_use]
    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    /// Execute a request and wait for its document.
    pub async fn request(&self, request: Request) -> Result<Document, RequestError> {
        self.submit(request).await
    }

    /// Start a request and return a cancellable handle to it.
    ///
    /// Outside a tokio runtime only cache hits succeed; anything that needs
    /// an execution resolves to a `Config` error.
    pub fn submit(&self, request: Request) -> RequestHandle {
        let key = request.cache_key();
        // Held across the cache lookup, the join and the insert so a finishing
        // execution is observed either in flight or cached, never neither.
        let mut in_flight = lock(&self.inner.in_flight);

        if let Some(key) = key.as_ref().filter(|_| !request.cache_options.reload) {
            let cached = lock(&self.inner.cache).lookup(key, Instant::now());
            match cached {
                Some((document, Freshness::Fresh)) if !request.cache_options.background_reload => {
                    tracing::debug!(key = %key, "Serving cached document");
                    return RequestHandle::ready(Some(key.clone()), Ok(document));
                }
                Some((document, Freshness::Fresh | Freshness::SoftExpired)) => {
                    tracing::debug!(key = %key, "Serving cached document, refreshing in background");
                    let key = key.clone();
                    let _refresh = self.join_or_start(&mut in_flight, request, Some(key.clone()));
                    return RequestHandle::ready(Some(key), Ok(document));
                }
                Some((_, Freshness::Expired)) | None => {}
            }
        }

        self.join_or_start(&mut in_flight, request, key)
    }

    /// Mark one cached document stale. Returns `false` if it was not cached.
    pub async fn invalidate(&self, request: &Request) -> bool {
        let Some(key) = request.cache_key() else {
            return false;
        };
        let invalidated = lock(&self.inner.cache).invalidate(&key);
        if invalidated {
            self.inner
                .store
                .write()
                .await
                .notify_request(key.as_str(), ChangeKind::State);
        }
        invalidated
    }

    /// Cached document for a request, regardless of age.
    #[must_use]
    pub fn peek(&self, request: &Request) -> Option<Document> {
        let key = request.cache_key()?;
        lock(&self.inner.cache)
            .lookup(&key, Instant::now())
            .map(|(document, _)| document)
    }

    /// Fetch the page after `document`, if it links one.
    pub fn next_page(&self, document: &Document) -> Option<RequestHandle> {
        let url = document.next_link()?;
        Some(self.submit(page_request(document, url)))
    }

    /// Fetch the page before `document`, if it links one.
    pub fn prev_page(&self, document: &Document) -> Option<RequestHandle> {
        let url = document.prev_link()?;
        Some(self.submit(page_request(document, url)))
    }

    /// Number of executions currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    /// Number of cached documents.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        lock(&self.inner.cache).len()
    }

    fn join_or_start(
        &self,
        in_flight: &mut BTreeMap<RequestKey, InFlight>,
        request: Request,
        key: Option<RequestKey>,
    ) -> RequestHandle {
        if let Some(entry) = key.as_ref().and_then(|key| in_flight.get(key)) {
            tracing::debug!(key = ?key, "Joining in-flight request");
            return RequestHandle {
                future: entry.future.clone(),
                cancel: Some(Arc::clone(&entry.cancel)),
                inner: Some(Arc::clone(&self.inner)),
                key,
            };
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            let err = RequestError::new(
                KeystoneError::Config("requests must be submitted inside a tokio runtime".into()),
                &request,
            );
            return RequestHandle::ready(key, Err(err));
        };

        let (tx, rx) = watch::channel(false);
        let cancel = Arc::new(tx);
        let inner = Arc::clone(&self.inner);
        let entry_key = key.clone();
        let entry_cancel = Arc::clone(&cancel);

        let future = async move {
            let result = match inner.begin_target(&request).await {
                Ok(target) => {
                    let result = tokio::select! {
                        biased;
                        () = cancelled(rx) => Err(RequestError::new(KeystoneError::Cancelled, &request)),
                        result = inner.execute(&request, target.map(|(_, id)| id)) => result,
                    };
                    if let Some((record, id)) = target {
                        inner.settle_target(record, id).await;
                    }
                    result
                }
                Err(err) => Err(err),
            };
            inner.finish(entry_key.as_ref(), &entry_cancel, &request, result).await
        }
        .boxed()
        .shared();

        if let Some(key) = &key {
            in_flight.insert(
                key.clone(),
                InFlight {
                    future: future.clone(),
                    cancel: Arc::clone(&cancel),
                },
            );
        }
        runtime.spawn(future.clone());

        RequestHandle {
            key,
            future,
            cancel: Some(cancel),
            inner: Some(Arc::clone(&self.inner)),
        }
    }
}

impl Inner {
    /// Move the request's target record to `loading`. Returns `None` when
    /// the request has no target or another request already owns it.
    async fn begin_target(
        &self,
        request: &Request,
    ) -> Result<Option<(ResourceKey, RequestId)>, RequestError> {
        let Some(target) = &request.target else {
            return Ok(None);
        };
        let mut store = self.store.write().await;
        let key = store
            .key_for(&target.resource_type, Some(&target.id))
            .map_err(|kind| RequestError::new(kind, request))?;
        if store
            .peek(key)
            .is_some_and(|record| record.state() == RecordState::Loading)
        {
            tracing::debug!(%key, "Target record already loading");
            return Ok(None);
        }
        let id = store
            .begin_request(key)
            .map_err(|kind| RequestError::new(kind, request))?;
        Ok(Some((key, id)))
    }

    /// Move a target record still loading under `id` to `error`. A record the
    /// response loaded is left alone.
    async fn settle_target(&self, key: ResourceKey, id: RequestId) {
        if let Err(err) = self.store.write().await.fail_request(key, id) {
            tracing::warn!(%key, error = %err, "Failed to settle target record");
        }
    }

    async fn execute(
        &self,
        request: &Request,
        request_id: Option<RequestId>,
    ) -> Result<(Document, BTreeSet<String>), RequestError> {
        tracing::info!(method = %request.method, url = %request.url, "Issuing request");
        let response = Next::new(Arc::clone(&self.chain)).run(request.clone()).await?;
        self.normalize(request, response, request_id).await
    }

    async fn normalize(
        &self,
        request: &Request,
        response: Response,
        request_id: Option<RequestId>,
    ) -> Result<(Document, BTreeSet<String>), RequestError> {
        let meta = ResponseMeta {
            status: response.status,
            headers: response.headers,
        };
        if response.body.is_null() {
            return Ok((Document::empty(request.clone(), meta), BTreeSet::new()));
        }

        let mut store = self.store.write().await;
        let request_id = request_id.unwrap_or_else(|| store.next_request_id());
        let outcome = store
            .push(&response.body, Some(request_id))
            .map_err(|kind| RequestError::new(kind, request))?;
        drop(store);

        let types = outcome.types.clone();
        Ok((
            Document::from_outcome(request.clone(), meta, outcome, request_id),
            types,
        ))
    }

    async fn finish(
        &self,
        key: Option<&RequestKey>,
        cancel: &Arc<watch::Sender<bool>>,
        request: &Request,
        result: Result<(Document, BTreeSet<String>), RequestError>,
    ) -> Result<Document, RequestError> {
        if let Some(key) = key {
            // Cache before leaving the in-flight table, under its guard.
            let mut in_flight = lock(&self.in_flight);
            if let Ok((document, types)) = &result {
                lock(&self.cache).insert(key.clone(), document.clone(), types.clone(), Instant::now());
            }
            remove_entry(&mut in_flight, key, cancel);
        }

        let (document, types) = match result {
            Ok(done) => done,
            Err(err) => {
                tracing::debug!(error = %err, "Request failed");
                return Err(err);
            }
        };

        let mut changed: Vec<RequestKey> = key.into_iter().cloned().collect();
        if request.method.is_mutation() && !types.is_empty() {
            let invalidated = lock(&self.cache).invalidate_types(&types);
            if !invalidated.is_empty() {
                tracing::debug!(count = invalidated.len(), "Invalidated cached documents");
            }
            changed.extend(invalidated);
        }

        if !changed.is_empty() {
            let mut store = self.store.write().await;
            for key in &changed {
                store.notify_request(key.as_str(), ChangeKind::State);
            }
        }
        Ok(document)
    }
}

// =============================================================================
// REQUEST HANDLE
// =============================================================================

/// A started request. Await it (directly or via `IntoFuture`) for the
/// document; `cancel` resolves every waiter with `Cancelled`.
pub struct RequestHandle {
    key: Option<RequestKey>,
    future: SharedResult,
    cancel: Option<Arc<watch::Sender<bool>>>,
    inner: Option<Arc<Inner>>,
}

impl RequestHandle {
    fn ready(key: Option<RequestKey>, result: Result<Document, RequestError>) -> Self {
        Self {
            key,
            future: futures::future::ready(result).boxed().shared(),
            cancel: None,
            inner: None,
        }
    }

    /// Cache key, for cacheable requests.
    #[must_use]
    pub fn key(&self) -> Option<&RequestKey> {
        self.key.as_ref()
    }

    /// Cancel the execution. A no-op once it has completed or when the
    /// document came from the cache.
    pub fn cancel(&self) {
        let Some(cancel) = &self.cancel else {
            return;
        };
        cancel.send_replace(true);
        if let (Some(key), Some(inner)) = (&self.key, &self.inner) {
            remove_entry(&mut lock(&inner.in_flight), key, cancel);
        }
        tracing::debug!(key = ?self.key, "Request cancelled");
    }
}

impl IntoFuture for RequestHandle {
    type Output = Result<Document, RequestError>;
    type IntoFuture = SharedResult;

    fn into_future(self) -> Self::IntoFuture {
        self.future
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("key", &self.key)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove an in-flight entry, but only if it still belongs to `cancel`'s
/// execution.
fn remove_entry(
    in_flight: &mut BTreeMap<RequestKey, InFlight>,
    key: &RequestKey,
    cancel: &Arc<watch::Sender<bool>>,
) {
    if in_flight
        .get(key)
        .is_some_and(|entry| Arc::ptr_eq(&entry.cancel, cancel))
    {
        in_flight.remove(key);
    }
}

/// Resolves once cancellation is signalled; never resolves otherwise.
async fn cancelled(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn page_request(document: &Document, url: &str) -> Request {
    Request {
        url: url.to_string(),
        headers: document.request.headers.clone(),
        op: document.request.op.clone(),
        ..Request::default()
    }
}
