use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use runledger_core::{CollectionKind, CoreError, RunEvent, RunMeta, RunSelector, Secret};
use runledger_runs::{
    CleanupReport, PushOutcome, PushRequest, RetentionPolicy, RunComparison, RunListing,
    RunStore, RunsError, StartRun,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tower_http::cors::CorsLayer;

const MAX_AUTH_HEADER_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone)]
pub struct ApiState {
    store: RunStore,
    operation_timeout: Duration,
    secret: Option<Secret>,
    retention: RetentionPolicy,
}

#[derive(Debug, Clone)]
pub struct ApiFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorPayload,
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    code: &'static str,
    message: String,
}

/// Response of every collection read.
#[derive(Debug, Serialize)]
struct ReadEnvelope {
    run_id: String,
    data: Value,
    degraded: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RunQuery {
    run_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CompareQuery {
    run_a: Option<String>,
    run_b: Option<String>,
}

/// Proof that the request carried the configured bearer token. Listed before
/// any body extractor, so an unauthorized body is never parsed.
#[derive(Debug, Clone, Copy)]
pub struct Authorized;

impl ApiFailure {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    fn invalid_json(rejection: &JsonRejection) -> Self {
        Self::invalid_request(rejection.body_text())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<RunsError> for ApiFailure {
    fn from(err: RunsError) -> Self {
        let message = err.to_string();
        match err {
            RunsError::InvalidInput(_) | RunsError::RunId(_) => Self::invalid_request(message),
            RunsError::Unavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable", message)
            }
        }
    }
}

impl From<CoreError> for ApiFailure {
    fn from(err: CoreError) -> Self {
        Self::invalid_request(err.to_string())
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = self.code, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            error: ErrorPayload {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl FromRequestParts<ApiState> for Authorized {
    type Rejection = ApiFailure;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        state.authorize(header)?;
        Ok(Self)
    }
}

impl ApiState {
    pub fn new(
        store: RunStore,
        operation_timeout: Duration,
        secret: Option<Secret>,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            store,
            operation_timeout,
            secret,
            retention,
        }
    }

    fn authorize(&self, header: Option<&str>) -> Result<(), ApiFailure> {
        let Some(secret) = &self.secret else {
            return Err(ApiFailure::unauthorized("no API secret is configured"));
        };
        let token = parse_bearer_token(header)?;
        if !secret.matches(token) {
            return Err(ApiFailure::unauthorized("invalid bearer token"));
        }
        Ok(())
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Runs a blocking read off the async runtime; past the operation
    /// deadline the caller gets a 504 and the result is dropped.
    async fn run_blocking<T, F>(&self, operation: &'static str, op: F) -> Result<T, ApiFailure>
    where
        T: Send + 'static,
        F: FnOnce(RunStore) -> Result<T, RunsError> + Send + 'static,
    {
        let store = self.store.clone();
        let handle = tokio::task::spawn_blocking(move || op(store));
        let joined = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                ApiFailure::new(
                    StatusCode::GATEWAY_TIMEOUT,
                    "timeout",
                    format!("{operation} timed out after {} ms", self.timeout_ms()),
                )
            })?;
        settle(operation, joined)
    }

    /// Runs a blocking write to completion. The response always reports what
    /// the store committed; each backend call stays bounded by the storage
    /// deadline, and a call that exceeds it rolls back and surfaces as 503.
    async fn run_write<T, F>(&self, operation: &'static str, op: F) -> Result<T, ApiFailure>
    where
        T: Send + 'static,
        F: FnOnce(RunStore) -> Result<T, RunsError> + Send + 'static,
    {
        let store = self.store.clone();
        let joined = tokio::task::spawn_blocking(move || op(store)).await;
        settle(operation, joined)
    }
}

fn settle<T>(
    operation: &'static str,
    joined: Result<Result<T, RunsError>, tokio::task::JoinError>,
) -> Result<T, ApiFailure> {
    let result = joined.map_err(|err| {
        ApiFailure::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            format!("{operation} join failure: {err}"),
        )
    })?;
    result.map_err(ApiFailure::from)
}

fn parse_bearer_token(header: Option<&str>) -> Result<&str, ApiFailure> {
    let header = header.ok_or_else(|| ApiFailure::unauthorized("missing authorization"))?;
    if header.len() > MAX_AUTH_HEADER_BYTES {
        return Err(ApiFailure::unauthorized("authorization header too large"));
    }
    let mut parts = header.trim().splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default().trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(ApiFailure::unauthorized("invalid authorization header"));
    }
    Ok(token)
}

fn required_param<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, ApiFailure> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiFailure::invalid_request(format!("missing query parameter '{name}'")))
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/push", post(push))
        .route("/api/runs", get(list_runs).post(start_run))
        .route("/api/runs/{run_id}/meta", get(run_meta).post(update_run_meta))
        .route("/api/runs/{run_id}/events", post(append_run_event))
        .route("/api/summary", get(summary))
        .route("/api/evaluations", get(evaluations))
        .route("/api/clusters", get(clusters))
        .route("/api/ranking", get(ranking))
        .route("/api/trace", get(trace))
        .route("/api/prompt-bundle", get(prompt_bundle))
        .route("/api/compare", get(compare))
        .route("/api/cleanup", post(cleanup))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: ApiState, bind: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(%bind, auth = state.secret.is_some(), "runledger API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timeout_ms": state.timeout_ms(),
        "auth_configured": state.secret.is_some(),
    }))
}

async fn push(
    State(state): State<ApiState>,
    _auth: Authorized,
    payload: Result<Json<PushRequest>, JsonRejection>,
) -> Result<Json<PushOutcome>, ApiFailure> {
    let Json(request) = payload.map_err(|rejection| ApiFailure::invalid_json(&rejection))?;
    let outcome = state
        .run_write("push", move |store| store.apply_push(request))
        .await?;
    Ok(Json(outcome))
}

async fn start_run(
    State(state): State<ApiState>,
    _auth: Authorized,
    payload: Result<Json<StartRun>, JsonRejection>,
) -> Result<Json<RunMeta>, ApiFailure> {
    let Json(request) = payload.map_err(|rejection| ApiFailure::invalid_json(&rejection))?;
    let meta = state
        .run_write("start_run", move |store| store.start_new_current_run(request))
        .await?;
    Ok(Json(meta))
}

async fn list_runs(State(state): State<ApiState>) -> Result<Json<RunListing>, ApiFailure> {
    let listing = state
        .run_blocking("list_runs", |store| Ok(store.list_runs()))
        .await?;
    Ok(Json(listing))
}

async fn run_meta(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> Result<Json<ReadEnvelope>, ApiFailure> {
    let selector = RunSelector::parse(Some(run_id.as_str()))?;
    let envelope = state
        .run_blocking("run_meta", move |store| {
            let run_id = store.resolve_read(&selector);
            let lookup = store.run_meta(&run_id);
            let degraded = lookup.is_unavailable();
            let data = lookup
                .found()
                .and_then(|meta| serde_json::to_value(meta).ok())
                .unwrap_or(Value::Null);
            Ok(ReadEnvelope {
                run_id,
                data,
                degraded,
            })
        })
        .await?;
    Ok(Json(envelope))
}

async fn update_run_meta(
    State(state): State<ApiState>,
    _auth: Authorized,
    Path(run_id): Path<String>,
    payload: Result<Json<Map<String, Value>>, JsonRejection>,
) -> Result<Json<RunMeta>, ApiFailure> {
    let selector = RunSelector::parse(Some(run_id.as_str()))?;
    let Json(patch) = payload.map_err(|rejection| ApiFailure::invalid_json(&rejection))?;
    let meta = state
        .run_write("update_run_meta", move |store| {
            let run_id = store.resolve_write(&selector)?;
            store.set_run_meta(&run_id, &patch)
        })
        .await?;
    Ok(Json(meta))
}

async fn append_run_event(
    State(state): State<ApiState>,
    _auth: Authorized,
    Path(run_id): Path<String>,
    payload: Result<Json<RunEvent>, JsonRejection>,
) -> Result<Json<RunMeta>, ApiFailure> {
    let selector = RunSelector::parse(Some(run_id.as_str()))?;
    let Json(event) = payload.map_err(|rejection| ApiFailure::invalid_json(&rejection))?;
    let meta = state
        .run_write("append_run_event", move |store| {
            let run_id = store.resolve_write(&selector)?;
            store.append_run_event(&run_id, &event)
        })
        .await?;
    Ok(Json(meta))
}

async fn read_collection(
    state: ApiState,
    query: RunQuery,
    kind: CollectionKind,
) -> Result<Json<ReadEnvelope>, ApiFailure> {
    let selector = RunSelector::parse(query.run_id.as_deref())?;
    let envelope = state
        .run_blocking(kind.as_str(), move |store| {
            let run_id = store.resolve_read(&selector);
            let lookup = store.read_collection(&run_id, kind);
            let degraded = lookup.is_unavailable();
            let data = match lookup.found() {
                Some(data) => data,
                None if kind.is_singleton() => Value::Null,
                None => Value::Array(Vec::new()),
            };
            Ok(ReadEnvelope {
                run_id,
                data,
                degraded,
            })
        })
        .await?;
    Ok(Json(envelope))
}

async fn summary(
    State(state): State<ApiState>,
    Query(query): Query<RunQuery>,
) -> Result<Json<ReadEnvelope>, ApiFailure> {
    read_collection(state, query, CollectionKind::Summary).await
}

async fn evaluations(
    State(state): State<ApiState>,
    Query(query): Query<RunQuery>,
) -> Result<Json<ReadEnvelope>, ApiFailure> {
    read_collection(state, query, CollectionKind::Evaluations).await
}

async fn clusters(
    State(state): State<ApiState>,
    Query(query): Query<RunQuery>,
) -> Result<Json<ReadEnvelope>, ApiFailure> {
    read_collection(state, query, CollectionKind::Clusters).await
}

async fn ranking(
    State(state): State<ApiState>,
    Query(query): Query<RunQuery>,
) -> Result<Json<ReadEnvelope>, ApiFailure> {
    read_collection(state, query, CollectionKind::Ranking).await
}

async fn trace(
    State(state): State<ApiState>,
    Query(query): Query<RunQuery>,
) -> Result<Json<ReadEnvelope>, ApiFailure> {
    read_collection(state, query, CollectionKind::Trace).await
}

async fn prompt_bundle(
    State(state): State<ApiState>,
    Query(query): Query<RunQuery>,
) -> Result<Json<ReadEnvelope>, ApiFailure> {
    read_collection(state, query, CollectionKind::PromptBundle).await
}

async fn compare(
    State(state): State<ApiState>,
    Query(query): Query<CompareQuery>,
) -> Result<Json<RunComparison>, ApiFailure> {
    let run_a = RunSelector::parse(Some(required_param(query.run_a.as_deref(), "run_a")?))?;
    let run_b = RunSelector::parse(Some(required_param(query.run_b.as_deref(), "run_b")?))?;

    let comparison = state
        .run_blocking("compare", move |store| {
            let run_a = store.resolve_read(&run_a);
            let run_b = store.resolve_read(&run_b);
            Ok(store.compare_runs(&run_a, &run_b))
        })
        .await?;
    Ok(Json(comparison))
}

async fn cleanup(
    State(state): State<ApiState>,
    _auth: Authorized,
) -> Result<Json<CleanupReport>, ApiFailure> {
    let policy = state.retention;
    let report = state
        .run_write("cleanup", move |store| store.cleanup(policy))
        .await?;
    Ok(Json(report))
}
