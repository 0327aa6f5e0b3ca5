//! # CLI Command Implementations

use crate::config::KeystoneConfig;
use keystone_core::{KeystoneError, ResourceKey, Store};
use keystone_request::handlers::{AuthHandler, FetchHandler, RateLimitHandler, RetryHandler};
use keystone_request::{Document, Method, Pipeline, Request};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

// =============================================================================
// FILE LIMITS
// =============================================================================

/// Maximum payload file size (100 MB).
const MAX_PAYLOAD_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Read and parse a JSON file after checking that it is a regular file
/// within the size limit.
fn read_json(path: &Path) -> Result<Value, KeystoneError> {
    let canonical: PathBuf = path.canonicalize().map_err(|e| {
        KeystoneError::Config(format!("Invalid file path '{}': {}", path.display(), e))
    })?;
    if !canonical.is_file() {
        return Err(KeystoneError::Config(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }
    let metadata = std::fs::metadata(&canonical)
        .map_err(|e| KeystoneError::Config(format!("Cannot read file metadata: {}", e)))?;
    if metadata.len() > MAX_PAYLOAD_FILE_SIZE {
        return Err(KeystoneError::Config(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            MAX_PAYLOAD_FILE_SIZE
        )));
    }
    let contents = std::fs::read(&canonical)
        .map_err(|e| KeystoneError::Config(format!("Read file: {}", e)))?;
    serde_json::from_slice(&contents)
        .map_err(|e| KeystoneError::Normalization(format!("invalid JSON in '{}': {e}", path.display())))
}

// =============================================================================
// PIPELINE ASSEMBLY
// =============================================================================

/// Build the handler chain described by `config`:
/// auth (if a key is set), retry, rate limit (if non-zero), fetch.
pub fn build_pipeline(config: &KeystoneConfig, store: Store) -> Result<Pipeline, KeystoneError> {
    let mut builder = Pipeline::builder().cache_policy(config.cache);
    if let Some(key) = &config.remote.api_key {
        builder = builder.handler(AuthHandler::new(key.clone()));
    }
    builder = builder.handler(RetryHandler::new(config.retry));
    if config.rate_limit.requests_per_second > 0 {
        builder = builder.handler(RateLimitHandler::new(config.rate_limit.requests_per_second));
    }
    let fetch = FetchHandler::new(&config.remote.base_url)?;
    Ok(builder.handler(fetch).build(Arc::new(RwLock::new(store))))
}

/// Assemble a request from command line pieces.
pub fn build_request(
    path: &str,
    method: &str,
    params: Vec<(String, String)>,
    data: Option<&Path>,
    reload: bool,
) -> Result<Request, KeystoneError> {
    let method: Method = method.parse()?;
    let mut request = Request::new(method, path).header("accept", "application/vnd.api+json");
    for (key, value) in params {
        request = request.param(key, value);
    }
    if let Some(data) = data {
        request = request
            .body(read_json(data)?)
            .header("content-type", "application/vnd.api+json");
    }
    if reload {
        request = request.reload();
    }
    Ok(request)
}

// =============================================================================
// RENDERING
// =============================================================================

/// JSON view of one resource as the store holds it.
pub fn describe_resource(store: &Store, key: ResourceKey) -> Value {
    let Some(info) = store.describe(key) else {
        return json!({ "key": key.0 });
    };
    let mut relationships = Map::new();
    let mut attributes = Value::Null;
    let mut state = Value::Null;
    if let Some(record) = store.peek(key) {
        attributes = json!(record.attributes());
        state = json!(record.state());
        for field in record.relationships() {
            let members: Vec<String> = store
                .materialize(key, field)
                .into_iter()
                .filter_map(|member| store.describe(member).map(ToString::to_string))
                .collect();
            relationships.insert(field.clone(), json!(members));
        }
    }
    json!({
        "type": info.resource_type,
        "id": info.id,
        "lid": info.lid,
        "state": state,
        "attributes": attributes,
        "relationships": relationships,
    })
}

fn print_resource(resource: &Value) {
    let label = match (resource["id"].as_str(), resource["lid"].as_str()) {
        (Some(id), _) => id,
        (None, Some(lid)) => lid,
        (None, None) => "?",
    };
    println!(
        "{}:{} ({})",
        resource["type"].as_str().unwrap_or("?"),
        label,
        resource["state"].as_str().unwrap_or("unknown")
    );
    if let Some(attributes) = resource["attributes"].as_object() {
        for (name, value) in attributes {
            println!("  {name} = {value}");
        }
    }
    if let Some(relationships) = resource["relationships"].as_object() {
        for (field, members) in relationships {
            let members: Vec<&str> = members
                .as_array()
                .map(|m| m.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            println!("  {field} -> [{}]", members.join(", "));
        }
    }
}

fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// =============================================================================
// FETCH COMMAND
// =============================================================================

/// Fetch a document, following up to `pages` pages.
pub async fn cmd_fetch(
    config: &KeystoneConfig,
    json_mode: bool,
    request: Request,
    pages: usize,
) -> Result<(), KeystoneError> {
    let schema = config.load_schema()?;
    let pipeline = build_pipeline(config, Store::new(schema)?)?;

    tracing::info!(url = %request.url, base_url = %config.remote.base_url, "Fetching");
    let mut documents: Vec<Document> = vec![pipeline.request(request).await?];
    while documents.len() < pages.max(1) {
        let Some(handle) = documents.last().and_then(|doc| pipeline.next_page(doc)) else {
            break;
        };
        documents.push(handle.await?);
    }

    let store = pipeline.store().read().await;
    let rendered: Vec<Value> = documents
        .iter()
        .map(|doc| {
            json!({
                "url": doc.request.url,
                "status": doc.response.status,
                "data": doc.keys().into_iter().map(|k| describe_resource(&store, k)).collect::<Vec<_>>(),
                "included": doc.included.iter().map(|k| describe_resource(&store, *k)).collect::<Vec<_>>(),
                "meta": doc.meta,
                "links": {
                    "next": doc.next_link(),
                    "prev": doc.prev_link(),
                },
            })
        })
        .collect();

    if json_mode {
        print_json(&json!({ "pages": rendered, "records": store.cache().len() }));
        return Ok(());
    }

    for page in &rendered {
        println!("{} [{}]", page["url"].as_str().unwrap_or_default(), page["status"]);
        println!("------------------------------");
        for resource in page["data"].as_array().into_iter().flatten() {
            print_resource(resource);
        }
        if let Some(included) = page["included"].as_array().filter(|i| !i.is_empty()) {
            println!();
            println!("Included:");
            for resource in included {
                print_resource(resource);
            }
        }
        println!();
    }
    println!("Records in store: {}", store.cache().len());
    Ok(())
}

// =============================================================================
// PUSH COMMAND
// =============================================================================

/// Normalize a payload file into a fresh store and print the result.
pub fn cmd_push(config: &KeystoneConfig, json_mode: bool, file: &Path) -> Result<(), KeystoneError> {
    tracing::info!("Normalizing {:?}", file);

    let payload = read_json(file)?;
    let mut store = Store::new(config.load_schema()?)?;
    let outcome = store.push(&payload, None)?;

    let data: Vec<Value> = outcome
        .content
        .keys()
        .into_iter()
        .map(|key| describe_resource(&store, key))
        .collect();
    let included: Vec<Value> = outcome
        .included
        .iter()
        .map(|key| describe_resource(&store, *key))
        .collect();

    if json_mode {
        print_json(&json!({
            "data": data,
            "included": included,
            "types": outcome.types,
            "meta": outcome.meta,
            "records": store.cache().len(),
        }));
        return Ok(());
    }

    println!("Normalized {:?}", file);
    println!("==================");
    for resource in data.iter().chain(&included) {
        print_resource(resource);
    }
    println!();
    println!("Records in store: {}", store.cache().len());
    Ok(())
}

// =============================================================================
// SCHEMA COMMAND
// =============================================================================

/// Validate and print the configured schema.
pub fn cmd_schema(config: &KeystoneConfig, json_mode: bool) -> Result<(), KeystoneError> {
    let schema = config.load_schema()?;

    if json_mode {
        print_json(&serde_json::to_value(&schema).unwrap_or_default());
        return Ok(());
    }

    match &config.schema {
        Some(path) => println!("Schema: {:?}", path),
        None => println!("Schema: (none configured)"),
    }
    println!("Types:  {}", schema.len());
    for (name, def) in &schema.types {
        println!();
        println!("{name}");
        if !def.attributes.is_empty() {
            let attributes: Vec<&str> = def.attributes.iter().map(String::as_str).collect();
            println!("  attributes: {}", attributes.join(", "));
        }
        for (field, rel) in &def.relationships {
            match &rel.inverse {
                Some(inverse) => println!(
                    "  {field}: {} {} (inverse {}.{inverse})",
                    rel.kind, rel.related_type, rel.related_type
                ),
                None => println!("  {field}: {} {}", rel.kind, rel.related_type),
            }
        }
    }
    Ok(())
}

// =============================================================================
// CONFIG COMMAND
// =============================================================================

/// Print the effective configuration with the API key redacted.
pub fn cmd_config(config: &KeystoneConfig, json_mode: bool) -> Result<(), KeystoneError> {
    let mut shown = config.clone();
    if shown.remote.api_key.is_some() {
        shown.remote.api_key = Some("<redacted>".to_string());
    }

    if json_mode {
        print_json(&serde_json::to_value(&shown).unwrap_or_default());
        return Ok(());
    }

    println!("Keystone Configuration");
    println!("======================");
    match &shown.schema {
        Some(path) => println!("Schema:      {:?}", path),
        None => println!("Schema:      (none)"),
    }
    println!("Base URL:    {}", shown.remote.base_url);
    println!(
        "API key:     {}",
        shown.remote.api_key.as_deref().unwrap_or("(none)")
    );
    println!(
        "Retry:       {} attempts, {}..{} ms",
        shown.retry.max_attempts, shown.retry.base_delay_ms, shown.retry.max_delay_ms
    );
    match shown.rate_limit.requests_per_second {
        0 => println!("Rate limit:  off"),
        rps => println!("Rate limit:  {rps}/s"),
    }
    println!(
        "Cache TTL:   soft {} ms, hard {} ms",
        shown.cache.soft_ttl_ms, shown.cache.hard_ttl_ms
    );
    Ok(())
}
