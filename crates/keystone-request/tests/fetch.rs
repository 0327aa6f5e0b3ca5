//! # Fetch Tests
//!
//! `FetchHandler` against a local axum server.

use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use keystone_core::{KeystoneError, RelationshipSchema, ResourceSchema, Schema, Store};
use keystone_request::handlers::{AuthHandler, FetchHandler};
use keystone_request::{Method, Pipeline, Request};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

async fn serve() -> String {
    let app = Router::new()
        .route(
            "/posts",
            get(
                |Query(query): Query<BTreeMap<String, String>>, headers: HeaderMap| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Json(json!({
                        "data": [{"type": "post", "id": "1", "attributes": {"title": "One"},
                                  "relationships": {"author": {"data": {"type": "user", "id": "9"}}}}],
                        "meta": {"query": query, "auth": auth}
                    }))
                },
            )
            .post(|Json(body): Json<Value>| async move {
                (
                    StatusCode::CREATED,
                    Json(json!({"data": {"type": "post", "id": "2", "attributes": body}})),
                )
            }),
        )
        .route("/posts/1", delete(|| async { StatusCode::NO_CONTENT }))
        .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "no such thing") }))
        .route("/garbled", post(|| async { "{not json" }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn pipeline() -> Pipeline {
    let schema = Schema::new()
        .resource(
            "post",
            ResourceSchema::new()
                .attribute("title")
                .relationship("author", RelationshipSchema::one("user").inverse("posts")),
        )
        .resource(
            "user",
            ResourceSchema::new()
                .relationship("posts", RelationshipSchema::many("post").inverse("author")),
        );
    let store = Arc::new(RwLock::new(Store::new(schema).expect("store")));
    Pipeline::builder()
        .handler(AuthHandler::new("token-1"))
        .handler(FetchHandler::new(&serve().await).expect("base"))
        .build(store)
}

#[tokio::test]
async fn get_sends_params_and_auth() {
    let pipeline = pipeline().await;
    let doc = pipeline
        .request(Request::get("/posts").param("include", "author"))
        .await
        .expect("posts");

    assert_eq!(doc.response.status, 200);
    assert_eq!(
        doc.meta,
        Some(json!({"query": {"include": "author"}, "auth": "Bearer token-1"}))
    );
    let store = pipeline.store().read().await;
    let post = store.lookup("post", "1").expect("post");
    let user = store.lookup("user", "9").expect("user");
    assert_eq!(doc.keys(), vec![post]);
    assert_eq!(store.materialize(user, "posts"), vec![post]);
}

#[tokio::test]
async fn post_sends_json_body() {
    let pipeline = pipeline().await;
    let doc = pipeline
        .request(Request::new(Method::Post, "/posts").body(json!({"title": "Two"})))
        .await
        .expect("created");

    assert_eq!(doc.response.status, 201);
    let store = pipeline.store().read().await;
    let post = store.lookup("post", "2").expect("post");
    assert_eq!(store.attribute(post, "title"), Some(&json!("Two")));
}

#[tokio::test]
async fn no_content_is_an_empty_document() {
    let pipeline = pipeline().await;
    let doc = pipeline
        .request(Request::new(Method::Delete, "/posts/1"))
        .await
        .expect("deleted");
    assert_eq!(doc.response.status, 204);
    assert!(doc.keys().is_empty());
}

#[tokio::test]
async fn error_status_is_a_transport_error() {
    let pipeline = pipeline().await;
    let err = pipeline
        .request(Request::get("/missing"))
        .await
        .expect_err("404");
    assert_eq!(
        err.kind,
        KeystoneError::Transport {
            status: Some(404),
            message: "no such thing".to_string(),
        }
    );
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn invalid_json_is_a_normalization_error() {
    let pipeline = pipeline().await;
    let err = pipeline
        .request(Request::new(Method::Post, "/garbled"))
        .await
        .expect_err("garbled");
    assert!(matches!(err.kind, KeystoneError::Normalization(_)));
}

#[tokio::test]
async fn unreachable_server_is_retryable() {
    let store = Arc::new(RwLock::new(Store::new(Schema::new()).expect("store")));
    let pipeline = Pipeline::builder()
        .handler(FetchHandler::new("http://127.0.0.1:1").expect("base"))
        .build(store);
    let err = pipeline
        .request(Request::get("/posts"))
        .await
        .expect_err("refused");
    assert!(matches!(err.kind, KeystoneError::Transport { status: None, .. }));
    assert!(err.is_retryable());
}
