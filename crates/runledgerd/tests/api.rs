use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use runledger_core::Secret;
use runledger_runs::{RetentionPolicy, RunStore};
use runledger_store::{KvBackend, KvRow, KvStore, SqliteKv, StoreError};
use runledgerd::api::{ApiState, router};
use serde_json::{Value, json};
use tower::ServiceExt;

const TOKEN: &str = "test-token";

fn memory_store() -> RunStore {
    let kv = KvStore::open_in_memory(Duration::from_secs(5)).expect("open in-memory store");
    RunStore::new(kv)
}

fn app_with(store: RunStore, secret: Option<&str>) -> Router {
    let secret = secret.map(|value| Secret::new(value.to_owned()));
    router(ApiState::new(
        store,
        Duration::from_secs(5),
        secret,
        RetentionPolicy::KeepBest,
    ))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request")
}

fn post(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("build request")
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.expect("router request")
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("body is JSON")
}

#[derive(Debug)]
struct DownBackend;

impl KvBackend for DownBackend {
    fn get(&self, _key: &str) -> Result<Option<Value>, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn set(&self, _key: &str, _value: &Value) -> Result<(), StoreError> {
        Err(StoreError::Poisoned)
    }

    fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Poisoned)
    }

    fn delete_if(&self, _key: &str, _expected: &Value) -> Result<bool, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn set_many(&self, _entries: &[(String, Value)]) -> Result<Vec<bool>, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn scan_prefix(&self, _prefix: &str) -> Result<Vec<KvRow>, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn count_prefix(&self, _prefix: &str) -> Result<usize, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn delete_prefix(&self, _prefix: &str) -> Result<usize, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn update(
        &self,
        _key: &str,
        _apply: &mut dyn FnMut(Option<Value>) -> Option<Value>,
    ) -> Result<Option<Value>, StoreError> {
        Err(StoreError::Poisoned)
    }
}

/// Real SQLite storage whose batch writes outlast the HTTP operation timeout.
#[derive(Debug)]
struct SlowBatches {
    inner: SqliteKv,
    delay: Duration,
}

impl KvBackend for SlowBatches {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key)
    }

    fn delete_if(&self, key: &str, expected: &Value) -> Result<bool, StoreError> {
        self.inner.delete_if(key, expected)
    }

    fn set_many(&self, entries: &[(String, Value)]) -> Result<Vec<bool>, StoreError> {
        std::thread::sleep(self.delay);
        self.inner.set_many(entries)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<KvRow>, StoreError> {
        self.inner.scan_prefix(prefix)
    }

    fn count_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        self.inner.count_prefix(prefix)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        self.inner.delete_prefix(prefix)
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<Value>) -> Option<Value>,
    ) -> Result<Option<Value>, StoreError> {
        self.inner.update(key, apply)
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let app = app_with(memory_store(), None);

    let response = send(&app, get("/api/health")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["auth_configured"], json!(false));
}

#[tokio::test]
async fn push_requires_matching_bearer_token() {
    let store = memory_store();
    let app = app_with(store.clone(), Some(TOKEN));
    let payload = json!({"type": "evaluation", "data": {"pr_number": 1}});

    for token in [None, Some("wrong-token")] {
        let response = send(&app, post("/api/push", token, payload.clone())).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"]["code"], json!("unauthorized"));
    }

    let unparsable = Request::builder()
        .method("POST")
        .uri("/api/push")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .expect("build request");
    assert_eq!(send(&app, unparsable).await.status(), StatusCode::UNAUTHORIZED);

    assert!(store.list_run_ids().is_empty());
}

#[tokio::test]
async fn protected_routes_reject_everything_without_configured_secret() {
    let app = app_with(memory_store(), None);

    let response = send(&app, post("/api/cleanup", Some(TOKEN), json!({}))).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn pushed_evaluations_are_served_for_the_run() {
    let app = app_with(memory_store(), Some(TOKEN));

    for score in [8.5, 9.1] {
        let response = send(
            &app,
            post(
                "/api/push",
                Some(TOKEN),
                json!({
                    "run_id": "1700000000000",
                    "type": "evaluation",
                    "data": {"pr_number": 7, "final_score": score}
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = send(&app, get("/api/evaluations?run_id=1700000000000")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["run_id"], json!("1700000000000"));
    assert_eq!(body["degraded"], json!(false));
    let evaluations = body["data"].as_array().expect("evaluation array");
    assert_eq!(evaluations.len(), 1);
    assert_eq!(evaluations[0]["final_score"], json!(9.1));
    assert_eq!(evaluations[0]["title"], json!("(untitled PR)"));

    let latest = body_json(send(&app, get("/api/evaluations")).await).await;
    assert_eq!(latest["run_id"], json!("1700000000000"));
}

#[tokio::test]
async fn malformed_writes_are_client_errors() {
    let store = memory_store();
    let app = app_with(store.clone(), Some(TOKEN));

    let missing_number = send(
        &app,
        post("/api/push", Some(TOKEN), json!({"type": "evaluation", "data": {"title": "x"}})),
    )
    .await;
    assert_eq!(missing_number.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(missing_number).await["error"]["code"],
        json!("invalid_request")
    );

    let unknown_type = send(
        &app,
        post("/api/push", Some(TOKEN), json!({"type": "bogus", "data": {}})),
    )
    .await;
    assert_eq!(unknown_type.status(), StatusCode::BAD_REQUEST);

    let bad_run_id = send(
        &app,
        post(
            "/api/push",
            Some(TOKEN),
            json!({"run_id": "run:1", "type": "summary", "data": {}}),
        ),
    )
    .await;
    assert_eq!(bad_run_id.status(), StatusCode::BAD_REQUEST);

    assert!(store.list_run_ids().is_empty());
}

#[tokio::test]
async fn unknown_runs_read_as_empty() {
    let app = app_with(memory_store(), None);

    let clusters = body_json(send(&app, get("/api/clusters?run_id=nope")).await).await;
    assert_eq!(clusters["data"], json!([]));

    let summary = body_json(send(&app, get("/api/summary?run_id=nope")).await).await;
    assert_eq!(summary["data"], Value::Null);

    let meta = body_json(send(&app, get("/api/runs/nope/meta")).await).await;
    assert_eq!(meta["data"], Value::Null);
}

#[tokio::test]
async fn compare_requires_both_runs() {
    let store = memory_store();
    store
        .upsert_evaluation("a", json!({"pr_number": 5, "final_score": 6.0}))
        .expect("write a");
    store
        .upsert_evaluation("b", json!({"pr_number": 5, "final_score": 8.0}))
        .expect("write b");
    let app = app_with(store, None);

    let missing = send(&app, get("/api/compare?run_a=a")).await;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, get("/api/compare?run_a=a&run_b=b")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["rows"][0]["pr_number"], json!(5));
    assert_eq!(body["rows"][0]["delta"], json!(2.0));
    assert_eq!(body["run_a"]["run_id"], json!("a"));
}

#[tokio::test]
async fn run_lifecycle_over_http() {
    let app = app_with(memory_store(), Some(TOKEN));

    let started = send(
        &app,
        post(
            "/api/runs",
            Some(TOKEN),
            json!({"run_id": "1700000000000", "meta": {"kind": "baseline"}}),
        ),
    )
    .await;
    assert_eq!(started.status(), StatusCode::OK);
    assert_eq!(body_json(started).await["kind"], json!("baseline"));

    let event = send(
        &app,
        post(
            "/api/runs/1700000000000/events",
            Some(TOKEN),
            json!({"event": "completed"}),
        ),
    )
    .await;
    assert_eq!(body_json(event).await["status"], json!("completed"));

    let patched = send(
        &app,
        post(
            "/api/runs/1700000000000/meta",
            Some(TOKEN),
            json!({"model_name": "m-2"}),
        ),
    )
    .await;
    assert_eq!(body_json(patched).await["model_name"], json!("m-2"));

    let listing = body_json(send(&app, get("/api/runs")).await).await;
    assert_eq!(listing["current_run"], json!("1700000000000"));
    assert_eq!(listing["runs"][0]["status"], json!("completed"));
    assert_eq!(listing["runs"][0]["evaluation_count"], json!(0));

    let cleanup = send(&app, post("/api/cleanup", Some(TOKEN), json!({}))).await;
    assert_eq!(cleanup.status(), StatusCode::OK);
    assert_eq!(
        body_json(cleanup).await["protected"],
        json!(["1700000000000"])
    );
}

#[tokio::test]
async fn unreachable_backend_degrades_reads_and_fails_writes() {
    let store = RunStore::new(KvStore::new(Arc::new(DownBackend)));
    let app = app_with(store, Some(TOKEN));

    let response = send(&app, get("/api/evaluations")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["degraded"], json!(true));
    assert_eq!(body["data"], json!([]));

    let listing = body_json(send(&app, get("/api/runs")).await).await;
    assert_eq!(listing["degraded"], json!(true));
    assert_eq!(listing["runs"], json!([]));

    let write = send(
        &app,
        post(
            "/api/push",
            Some(TOKEN),
            json!({"run_id": "1700000000000", "type": "summary", "data": {"a": 1}}),
        ),
    )
    .await;
    assert_eq!(write.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(write).await["error"]["code"],
        json!("backend_unavailable")
    );
}

#[tokio::test]
async fn slow_write_reports_what_was_committed() {
    let backend = SlowBatches {
        inner: SqliteKv::open_in_memory(Duration::from_secs(5)).expect("open in-memory kv"),
        delay: Duration::from_millis(150),
    };
    let store = RunStore::new(KvStore::new(Arc::new(backend)));
    let app = router(ApiState::new(
        store.clone(),
        Duration::from_millis(20),
        Some(Secret::new(TOKEN.to_owned())),
        RetentionPolicy::KeepBest,
    ));

    let response = send(
        &app,
        post(
            "/api/push",
            Some(TOKEN),
            json!({
                "run_id": "1700000000000",
                "type": "evaluations_batch",
                "data": [{"pr_number": 1}, {"pr_number": 2}]
            }),
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["inserted"], json!(2));
    assert_eq!(store.evaluation_count("1700000000000"), 2);
}
