//! Adapter tests against live local backends
//!
//! Tests adapter behavior end to end:
//! - HTTP request construction (path, query, body, headers, bearer)
//! - Upstream error mapping
//! - Registry lifecycle (create, execute, destroy)
//! - Statement serialization on one SQL instance

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use toolgate::adapter::{
    Adapter, AdapterKind, AdapterRegistry, AdapterRequest, RestAdapter, SqlAdapter,
};
use toolgate::error::Error;

type Hits = Arc<AtomicUsize>;

async fn ping(State(hits): State<Hits>, Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    hits.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "pong": true, "q": params.get("q") }))
}

async fn echo(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({ "echo": body }))
}

async fn whoami(headers: HeaderMap) -> Json<Value> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    Json(json!({
        "authorization": header("authorization"),
        "x-team": header("x-team"),
    }))
}

async fn boom() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "kaboom")
}

/// Spawn a stub backend on an ephemeral port; returns its base URL and a
/// counter of `/ping` hits
async fn spawn_backend() -> (String, Hits) {
    let hits: Hits = Arc::new(AtomicUsize::new(0));

    let app = Router::new()
        .route("/ping", get(ping))
        .route("/echo", post(echo))
        .route("/whoami", get(whoami))
        .route("/boom", get(boom))
        .with_state(Arc::clone(&hits));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), hits)
}

async fn rest_adapter(config: Value) -> RestAdapter {
    let adapter = RestAdapter::from_config(&config).unwrap();
    adapter.connect().await.unwrap();
    adapter
}

/// Test a GET round trip with query parameters
#[tokio::test]
async fn test_rest_get_with_query() {
    let (base_url, hits) = spawn_backend().await;
    let adapter = rest_adapter(json!({ "base_url": base_url })).await;

    let response = adapter
        .execute(&AdapterRequest::new(
            "GET /ping",
            json!({ "query": { "q": "42" } }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, json!({ "pong": true, "q": "42" }));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

/// Test that a JSON body is forwarded on POST
#[tokio::test]
async fn test_rest_posts_json_body() {
    let (base_url, _hits) = spawn_backend().await;
    let adapter = rest_adapter(json!({ "base_url": base_url })).await;

    let response = adapter
        .execute(&AdapterRequest::new(
            "POST /echo",
            json!({ "body": { "name": "ada", "n": 7 } }),
        ))
        .await
        .unwrap();

    assert_eq!(response.body, json!({ "echo": { "name": "ada", "n": 7 } }));
}

/// Test header layering: configured headers, per-request overrides, bearer
#[tokio::test]
async fn test_rest_header_layering() {
    let (base_url, _hits) = spawn_backend().await;

    // The bearer is referenced by env var name, loaded from an env file
    let dir = tempfile::tempdir().unwrap();
    let env_path = dir.path().join("bearer.env");
    std::fs::write(&env_path, "TOOLGATE_TEST_REST_BEARER=s3cret-bearer\n").unwrap();
    dotenvy::from_path(&env_path).unwrap();

    let adapter = rest_adapter(json!({
        "base_url": base_url,
        "headers": { "X-Team": "alpha" },
        "bearer_env": "TOOLGATE_TEST_REST_BEARER",
    }))
    .await;

    // Configured header applies
    let response = adapter
        .execute(&AdapterRequest::new("GET /whoami", json!({})))
        .await
        .unwrap();
    assert_eq!(response.body["x-team"], "alpha");
    assert_eq!(response.body["authorization"], "Bearer s3cret-bearer");

    // Per-request header wins over the configured one
    let response = adapter
        .execute(&AdapterRequest::new(
            "GET /whoami",
            json!({ "headers": { "X-Team": "beta" } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.body["x-team"], "beta");
}

/// Test that an upstream error status maps to an execution error
#[tokio::test]
async fn test_rest_upstream_error_mapping() {
    let (base_url, _hits) = spawn_backend().await;
    let adapter = rest_adapter(json!({ "base_url": base_url })).await;

    let err = adapter
        .execute(&AdapterRequest::new("GET /boom", json!({})))
        .await
        .unwrap_err();

    match err {
        Error::AdapterExecution { status, message } => {
            assert_eq!(status, Some(500));
            assert!(message.contains("kaboom"));
        }
        other => panic!("expected execution error, got {other:?}"),
    }
}

/// Test the registry lifecycle: create, execute, list, destroy
#[tokio::test]
async fn test_registry_lifecycle() {
    let (base_url, hits) = spawn_backend().await;
    let registry = AdapterRegistry::new(Duration::from_secs(5));

    let instance = registry
        .create(AdapterKind::Rest, &json!({ "base_url": base_url }), "tester")
        .await
        .unwrap();
    assert_eq!(instance.kind, AdapterKind::Rest);
    assert_eq!(instance.owner, "tester");
    assert!(registry.instance_ids().contains(&instance.id));

    let response = registry
        .execute(&instance.id, &AdapterRequest::new("GET /ping", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    registry.destroy(&instance.id).await.unwrap();
    assert!(registry.get(&instance.id).is_err());
    assert!(matches!(
        registry
            .execute(&instance.id, &AdapterRequest::new("GET /ping", json!({})))
            .await,
        Err(Error::AdapterNotFound(_))
    ));
}

/// Test that named instances from configuration keep their names
#[tokio::test]
async fn test_registry_named_instances() {
    let registry = AdapterRegistry::new(Duration::from_secs(5));

    registry
        .create_named("ledger", AdapterKind::Sql, &json!({ "path": ":memory:" }), "system")
        .await
        .unwrap();

    let instance = registry.get("ledger").unwrap();
    assert_eq!(instance.id, "ledger");
    assert_eq!(instance.owner, "system");

    // A second instance under the same name is rejected
    assert!(registry
        .create_named("ledger", AdapterKind::Sql, &json!({ "path": ":memory:" }), "system")
        .await
        .is_err());
}

/// Test that concurrent updates on one SQL instance serialize (no lost update)
#[tokio::test]
async fn test_sql_concurrent_increments_serialize() {
    const WRITERS: usize = 10;

    let adapter = Arc::new(SqlAdapter::from_config(&json!({ "path": ":memory:" })).unwrap());
    adapter.connect().await.unwrap();

    adapter
        .execute(&AdapterRequest::new(
            "execute",
            json!({ "sql": "CREATE TABLE counter (n INTEGER)" }),
        ))
        .await
        .unwrap();
    adapter
        .execute(&AdapterRequest::new(
            "execute",
            json!({ "sql": "INSERT INTO counter VALUES (0)" }),
        ))
        .await
        .unwrap();

    // Read-modify-write would lose updates if statements interleaved
    let mut tasks = Vec::new();
    for _ in 0..WRITERS {
        let adapter = Arc::clone(&adapter);
        tasks.push(tokio::spawn(async move {
            adapter
                .execute(&AdapterRequest::new(
                    "execute",
                    json!({ "sql": "UPDATE counter SET n = n + 1" }),
                ))
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let rows = adapter
        .execute(&AdapterRequest::new(
            "query",
            json!({ "sql": "SELECT n FROM counter" }),
        ))
        .await
        .unwrap();
    assert_eq!(rows.body, json!([{ "n": WRITERS }]));
}

/// Test that distinct SQL instances hold distinct databases
#[tokio::test]
async fn test_sql_instances_are_isolated() {
    let registry = AdapterRegistry::new(Duration::from_secs(5));
    let first = registry
        .create(AdapterKind::Sql, &json!({ "path": ":memory:" }), "tester")
        .await
        .unwrap();
    let second = registry
        .create(AdapterKind::Sql, &json!({ "path": ":memory:" }), "tester")
        .await
        .unwrap();

    registry
        .execute(
            &first.id,
            &AdapterRequest::new("execute", json!({ "sql": "CREATE TABLE only_here (n)" })),
        )
        .await
        .unwrap();

    // The table exists only in the first instance
    let err = registry
        .execute(
            &second.id,
            &AdapterRequest::new("query", json!({ "sql": "SELECT * FROM only_here" })),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AdapterExecution { .. }));
}
