//! # Pipeline Tests
//!
//! Coalescing, caching, invalidation, cancellation and pagination through
//! a scripted in-memory transport.

use keystone_core::{
    ChangeKind, DocumentContent, Interest, KeystoneError, RecordState, RelationshipSchema,
    ResourceSchema, Schema, Store, Subject,
};
use keystone_request::handlers::RetryHandler;
use keystone_request::{
    CachePolicy, Document, Handler, Method, Next, Pipeline, Request, RequestError, Response,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};

// =============================================================================
// FIXTURES
// =============================================================================

type Reply = Arc<dyn Fn(&Request) -> Result<Response, RequestError> + Send + Sync>;

/// Terminal handler answering from a closure, optionally held at a gate.
struct Scripted {
    reply: Reply,
    calls: Arc<AtomicUsize>,
    gate: Option<Arc<Semaphore>>,
}

#[async_trait::async_trait]
impl Handler for Scripted {
    async fn handle(&self, request: Request, _next: Next) -> Result<Response, RequestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        (self.reply)(&request)
    }
}

struct Harness {
    pipeline: Pipeline,
    calls: Arc<AtomicUsize>,
    gate: Arc<Semaphore>,
}

impl Harness {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn schema() -> Schema {
    Schema::new()
        .resource(
            "post",
            ResourceSchema::new()
                .attribute("title")
                .relationship("author", RelationshipSchema::one("user").inverse("posts")),
        )
        .resource(
            "user",
            ResourceSchema::new()
                .attribute("name")
                .relationship("posts", RelationshipSchema::many("post").inverse("author")),
        )
}

fn harness(
    gated: bool,
    policy: CachePolicy,
    reply: impl Fn(&Request) -> Result<Response, RequestError> + Send + Sync + 'static,
) -> Harness {
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(0));
    let store = Arc::new(RwLock::new(Store::new(schema()).expect("store")));
    let pipeline = Pipeline::builder()
        .cache_policy(policy)
        .handler(RetryHandler::default())
        .handler(Scripted {
            reply: Arc::new(reply),
            calls: Arc::clone(&calls),
            gate: gated.then(|| Arc::clone(&gate)),
        })
        .build(store);
    Harness {
        pipeline,
        calls,
        gate,
    }
}

fn post(id: &str, title: &str) -> Value {
    json!({
        "type": "post", "id": id, "attributes": {"title": title},
        "relationships": {"author": {"data": {"type": "user", "id": "9"}}}
    })
}

fn posts_page(request: &Request) -> Result<Response, RequestError> {
    Ok(Response::ok(json!({
        "data": [post("1", "One"), post("2", "Two")],
        "included": [{"type": "user", "id": "9", "attributes": {"name": "Ann"}}],
        "links": {"self": request.url.clone()}
    })))
}

async fn record_state(pipeline: &Pipeline, resource_type: &str, id: &str) -> Option<RecordState> {
    let store = pipeline.store().read().await;
    let key = store.lookup(resource_type, id)?;
    store.peek(key).map(|record| record.state())
}

async fn wait_idle(pipeline: &Pipeline) {
    while pipeline.in_flight() > 0 {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// COALESCING
// =============================================================================

#[tokio::test]
async fn identical_requests_share_one_execution() {
    let h = harness(true, CachePolicy::default(), posts_page);

    let a = h.pipeline.submit(Request::get("/posts").param("include", "author"));
    let b = h.pipeline.submit(Request::get("/posts?include=author"));
    assert_eq!(a.key(), b.key());
    assert_eq!(h.pipeline.in_flight(), 1);

    h.gate.add_permits(1);
    let (a, b) = tokio::join!(a.into_future(), b.into_future());
    let a = a.expect("a");
    let b = b.expect("b");

    assert_eq!(h.calls(), 1);
    assert_eq!(a, b);
    assert_eq!(h.pipeline.in_flight(), 0);

    let store = h.pipeline.store().read().await;
    let user = store.lookup("user", "9").expect("user");
    assert_eq!(store.materialize(user, "posts"), a.keys());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_submitters_never_start_a_second_execution() {
    let h = Arc::new(harness(false, CachePolicy::default(), posts_page));

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let h = Arc::clone(&h);
        tasks.push(tokio::spawn(async move {
            tokio::task::yield_now().await;
            h.pipeline.request(Request::get("/posts")).await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("document");
    }

    assert_eq!(h.calls(), 1);
    assert_eq!(h.pipeline.in_flight(), 0);
    assert_eq!(h.pipeline.cached_count(), 1);
}

#[tokio::test]
async fn mutations_are_not_coalesced() {
    let h = harness(false, CachePolicy::default(), |_| {
        Ok(Response::ok(json!({"data": post("3", "New")})))
    });

    let create = || Request::new(Method::Post, "/posts").body(json!({"title": "New"}));
    let a = h.pipeline.submit(create());
    let b = h.pipeline.submit(create());
    assert_eq!(h.pipeline.in_flight(), 0);
    a.await.expect("a");
    b.await.expect("b");
    assert_eq!(h.calls(), 2);
}

// =============================================================================
// REQUEST CACHE
// =============================================================================

#[tokio::test]
async fn cached_documents_are_served_until_reload() {
    let h = harness(false, CachePolicy::default(), posts_page);

    let first = h.pipeline.request(Request::get("/posts")).await.expect("first");
    let second = h.pipeline.request(Request::get("/posts")).await.expect("second");
    assert_eq!(first, second);
    assert_eq!(h.calls(), 1);
    assert_eq!(h.pipeline.cached_count(), 1);

    h.pipeline
        .request(Request::get("/posts").reload())
        .await
        .expect("reload");
    assert_eq!(h.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn soft_expiry_refreshes_in_background() {
    let policy = CachePolicy {
        soft_ttl_ms: 100,
        hard_ttl_ms: 1_000,
    };
    let h = harness(false, policy, posts_page);
    h.pipeline.request(Request::get("/posts")).await.expect("warm");

    tokio::time::advance(Duration::from_millis(500)).await;
    h.pipeline.request(Request::get("/posts")).await.expect("stale-while-revalidate");
    wait_idle(&h.pipeline).await;
    assert_eq!(h.calls(), 2);

    // The background refresh restarted the clock.
    tokio::time::advance(Duration::from_millis(50)).await;
    h.pipeline.request(Request::get("/posts")).await.expect("fresh");
    assert_eq!(h.calls(), 2);

    tokio::time::advance(Duration::from_millis(2_000)).await;
    h.pipeline.request(Request::get("/posts")).await.expect("expired");
    assert_eq!(h.calls(), 3);
}

#[tokio::test]
async fn background_reload_serves_cache_and_refetches() {
    let h = harness(false, CachePolicy::default(), posts_page);
    h.pipeline.request(Request::get("/posts")).await.expect("warm");

    let doc = h
        .pipeline
        .request(Request::get("/posts").background_reload())
        .await
        .expect("cached");
    assert_eq!(doc.keys().len(), 2);
    wait_idle(&h.pipeline).await;
    assert_eq!(h.calls(), 2);
}

#[tokio::test]
async fn mutation_invalidates_documents_of_touched_types() {
    let h = harness(false, CachePolicy::default(), |request| {
        if request.method == Method::Post {
            Ok(Response::ok(json!({"data": post("3", "New")})))
        } else {
            posts_page(request)
        }
    });
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    h.pipeline.store().write().await.subscribe(
        Interest::Requests,
        Arc::new(move |subject: &Subject, change: ChangeKind| {
            if let Ok(mut seen) = sink.lock() {
                seen.push((subject.clone(), change));
            }
        }),
    );

    let list = Request::get("/posts");
    h.pipeline.request(list.clone()).await.expect("list");
    if let Ok(mut seen) = events.lock() {
        seen.clear();
    }

    h.pipeline
        .request(Request::new(Method::Post, "/posts").body(json!({"title": "New"})))
        .await
        .expect("create");

    let seen = events.lock().map(|e| e.clone()).unwrap_or_default();
    assert!(seen.contains(&(Subject::Request(list.key().to_string()), ChangeKind::State)));

    h.pipeline.request(list).await.expect("refetched");
    assert_eq!(h.calls(), 3);
}

#[tokio::test]
async fn explicit_invalidation_forces_refetch() {
    let h = harness(false, CachePolicy::default(), posts_page);
    let list = Request::get("/posts");
    h.pipeline.request(list.clone()).await.expect("warm");

    assert!(h.pipeline.invalidate(&list).await);
    assert!(!h.pipeline.invalidate(&Request::get("/users")).await);
    h.pipeline.request(list).await.expect("refetched");
    assert_eq!(h.calls(), 2);
}

// =============================================================================
// FAILURE AND CANCELLATION
// =============================================================================

#[tokio::test]
async fn cancellation_resolves_every_waiter() {
    let h = harness(true, CachePolicy::default(), posts_page);

    let a = h.pipeline.submit(Request::get("/posts"));
    let b = h.pipeline.submit(Request::get("/posts"));
    while h.calls() == 0 {
        tokio::task::yield_now().await;
    }
    a.cancel();
    assert_eq!(h.pipeline.in_flight(), 0);

    let a = a.await.expect_err("cancelled");
    let b = b.await.expect_err("cancelled");
    assert!(a.is_cancelled() && b.is_cancelled());
    assert_eq!(h.pipeline.cached_count(), 0);

    // A later identical request starts a new execution.
    h.gate.add_permits(1);
    h.pipeline.request(Request::get("/posts")).await.expect("fresh run");
    assert_eq!(h.calls(), 2);
}

#[tokio::test]
async fn normalization_failure_leaves_store_untouched() {
    let h = harness(false, CachePolicy::default(), |_| {
        Ok(Response::ok(json!({"data": [
            post("1", "ok"),
            {"type": "post", "attributes": {"title": "no identity"}}
        ]})))
    });

    let err = h
        .pipeline
        .request(Request::get("/posts"))
        .await
        .expect_err("bad payload");
    assert!(matches!(err.kind, KeystoneError::Normalization(_)));
    assert_eq!(err.request.url, "/posts");
    assert_eq!(h.pipeline.cached_count(), 0);
    assert!(h.pipeline.store().read().await.registry().is_empty());
}

#[tokio::test]
async fn empty_body_yields_empty_document() {
    let h = harness(false, CachePolicy::default(), |_| {
        Ok(Response {
            status: 204,
            headers: Default::default(),
            body: Value::Null,
        })
    });

    let doc = h
        .pipeline
        .request(Request::new(Method::Delete, "/posts/1"))
        .await
        .expect("deleted");
    assert_eq!(doc.content, DocumentContent::Absent);
    assert_eq!(doc.response.status, 204);
    assert!(doc.request_id.is_none());
}

#[test]
fn submit_outside_a_runtime_resolves_to_an_error() {
    let h = harness(false, CachePolicy::default(), posts_page);

    let handle = h.pipeline.submit(Request::get("/posts"));
    assert!(handle.key().is_some());
    let err = futures::executor::block_on(handle.into_future()).expect_err("no runtime");
    assert!(matches!(err.kind, KeystoneError::Config(_)));
    assert_eq!(h.calls(), 0);
    assert_eq!(h.pipeline.in_flight(), 0);
}

// =============================================================================
// TARGET RECORD STATE
// =============================================================================

#[tokio::test]
async fn find_record_moves_target_through_loading_to_loaded() {
    let h = harness(true, CachePolicy::default(), |_| {
        Ok(Response::ok(json!({"data": post("1", "One")})))
    });

    let handle = h
        .pipeline
        .submit(Request::find_record("/posts/1", "post", "1"));
    while h.calls() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        record_state(&h.pipeline, "post", "1").await,
        Some(RecordState::Loading)
    );

    h.gate.add_permits(1);
    let doc = handle.await.expect("found");
    assert_eq!(
        record_state(&h.pipeline, "post", "1").await,
        Some(RecordState::Loaded)
    );

    let store = h.pipeline.store().read().await;
    let key = store.lookup("post", "1").expect("post");
    assert_eq!(doc.content, DocumentContent::One(key));
    assert_eq!(
        store.peek(key).and_then(|record| record.last_request()),
        doc.request_id
    );
}

#[tokio::test]
async fn failed_find_record_marks_target_error() {
    let h = harness(false, CachePolicy::default(), |request| {
        Err(RequestError::transport(Some(404), "not found", request))
    });

    let err = h
        .pipeline
        .request(Request::find_record("/posts/7", "post", "7"))
        .await
        .expect_err("missing");
    assert!(matches!(err.kind, KeystoneError::Transport { status: Some(404), .. }));
    assert_eq!(h.calls(), 1);
    assert_eq!(
        record_state(&h.pipeline, "post", "7").await,
        Some(RecordState::Error)
    );
}

#[tokio::test]
async fn find_record_answered_without_the_target_marks_error() {
    let h = harness(false, CachePolicy::default(), |_| {
        Ok(Response::ok(json!({"data": null})))
    });

    h.pipeline
        .request(Request::find_record("/posts/7", "post", "7"))
        .await
        .expect("null document");
    assert_eq!(
        record_state(&h.pipeline, "post", "7").await,
        Some(RecordState::Error)
    );
}

#[tokio::test]
async fn cancelled_find_record_does_not_stay_loading() {
    let h = harness(true, CachePolicy::default(), posts_page);

    let handle = h
        .pipeline
        .submit(Request::find_record("/posts/1", "post", "1"));
    while h.calls() == 0 {
        tokio::task::yield_now().await;
    }
    handle.cancel();
    let err = handle.await.expect_err("cancelled");
    assert!(err.is_cancelled());
    assert_eq!(
        record_state(&h.pipeline, "post", "1").await,
        Some(RecordState::Error)
    );
}

#[tokio::test]
async fn find_record_for_undeclared_type_fails_before_the_chain() {
    let h = harness(false, CachePolicy::default(), posts_page);

    let err = h
        .pipeline
        .request(Request::find_record("/comments/1", "comment", "1"))
        .await
        .expect_err("unknown type");
    assert!(matches!(err.kind, KeystoneError::UnknownType(_)));
    assert_eq!(h.calls(), 0);
}

// =============================================================================
// PAGINATION
// =============================================================================

#[tokio::test]
async fn follows_pagination_links() {
    let h = harness(false, CachePolicy::default(), |request| {
        let page = if request.url.contains("page=2") { 2 } else { 1 };
        let (data, links) = if page == 1 {
            (vec![post("1", "One")], json!({"next": "/posts?page=2"}))
        } else {
            (vec![post("2", "Two")], json!({"prev": "/posts?page=1"}))
        };
        Ok(Response::ok(json!({"data": data, "links": links})))
    });

    let first: Document = h
        .pipeline
        .request(Request::get("/posts?page=1").header("accept", "application/vnd.api+json"))
        .await
        .expect("page 1");
    assert!(h.pipeline.prev_page(&first).is_none());

    let second = h
        .pipeline
        .next_page(&first)
        .expect("has next")
        .await
        .expect("page 2");
    assert_eq!(second.request.url, "/posts?page=2");
    assert_eq!(
        second.request.headers.get("accept").map(String::as_str),
        Some("application/vnd.api+json")
    );
    assert!(h.pipeline.next_page(&second).is_none());

    // Going back is served from the request cache.
    let back = h
        .pipeline
        .prev_page(&second)
        .expect("has prev")
        .await
        .expect("page 1 again");
    assert_eq!(back.keys(), first.keys());
    assert_eq!(h.calls(), 2);
}
