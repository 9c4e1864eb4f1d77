//! HTTP server exposing retrieval, context assembly, statistics and the
//! webhook ingestion endpoint.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/retrieve` | Ranked chunks for a query |
//! | `POST` | `/v1/context` | Retrieval assembled into a token-bounded context payload |
//! | `GET`  | `/v1/statistics` | Index counters and per-source health |
//! | `POST` | `/v1/webhook` | Remote repository commit notifications |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `timeout` (408), `embedder_unavailable` (503), `unavailable` (503).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use live_context_core::context::ContextPayload;
use live_context_core::models::{LineRange, RetrievalResult, SourceType};
use live_context_core::retrieve::RetrieveRequest;
use live_context_core::EngineError;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::connector_fs::{self, LocalWatcher};
use crate::connector_webhook::{WebhookError, WebhookOutcome, WebhookReceiver};
use crate::engine::Engine;
use crate::stats::Statistics;

/// Largest `k` accepted by the query endpoints.
const MAX_K: usize = 200;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    engine: Arc<Engine>,
    /// `None` when the remote source is disabled.
    webhook: Option<Arc<WebhookReceiver>>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, webhook: Option<Arc<WebhookReceiver>>) -> Self {
        Self { engine, webhook }
    }
}

/// Build the router with all routes and the CORS layer.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/retrieve", post(handle_retrieve))
        .route("/v1/context", post(handle_context))
        .route("/v1/statistics", get(handle_statistics))
        .route("/v1/webhook", post(handle_webhook))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Serve on `listener` until `shutdown` resolves, then drain open connections.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Starts the engine, its sources and the HTTP server; runs until Ctrl-C.
///
/// The local source runs when `[watch].root` is set, the remote source when
/// `[webhook].enabled` is true. On shutdown the watcher stops first, then
/// each pipeline drains the events it already accepted.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let engine = Engine::new(config.clone())?;

    let mut local = None;
    if let Some(root) = &config.watch.root {
        let handle = engine.spawn_source(SourceType::Local);
        // Watch before scanning so nothing changed during the scan is missed;
        // files seen twice are dropped by content-hash dedup.
        let watcher = LocalWatcher::start(root, &config.watch, handle.sink())?;
        let initial = connector_fs::initial_events(root, &config.watch)?;
        tracing::info!(files = initial.len(), root = %watcher.root().display(), "queued initial scan");

        let sink = handle.sink();
        let scan = tokio::spawn(async move {
            for event in initial {
                if sink.send(event).await.is_err() {
                    break;
                }
            }
        });
        local = Some((handle, watcher, scan));
    }

    let mut remote = None;
    let mut webhook = None;
    if config.webhook.enabled {
        let handle = engine.spawn_source(SourceType::Remote);
        webhook = Some(Arc::new(WebhookReceiver::new(
            config.webhook.clone(),
            handle.sink(),
        )));
        remote = Some(handle);
    }

    let sweep = (config.index.integrity_interval_secs > 0).then(|| {
        engine.spawn_integrity_sweep(Duration::from_secs(config.index.integrity_interval_secs))
    });

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!("listening on http://{}", listener.local_addr()?);

    let state = AppState::new(Arc::clone(&engine), webhook);
    serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutting down");
    })
    .await?;

    if let Some(sweep) = sweep {
        sweep.abort();
    }
    if let Some((handle, watcher, scan)) = local {
        scan.abort();
        let _ = scan.await;
        watcher.stop().await;
        handle.shutdown().await;
    }
    if let Some(handle) = remote {
        handle.shutdown().await;
    }
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn unavailable(code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code,
        message: message.into(),
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Timeout(_) => AppError {
                status: StatusCode::REQUEST_TIMEOUT,
                code: "timeout",
                message: err.to_string(),
            },
            EngineError::EmbedderUnavailable(_) => unavailable("embedder_unavailable", err.to_string()),
            EngineError::MalformedInput(_) => bad_request(err.to_string()),
            other => AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message: other.to_string(),
            },
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

// ============ POST /v1/retrieve, POST /v1/context ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody {
    query: String,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    min_score: Option<f32>,
    #[serde(default)]
    token_budget: Option<usize>,
    /// Query deadline in milliseconds, capped at `retrieval.timeout_ms`.
    #[serde(default)]
    timeout_ms: Option<u64>,
}

impl QueryBody {
    fn to_request(&self, config: &Config) -> Result<RetrieveRequest, AppError> {
        if self.query.trim().is_empty() {
            return Err(bad_request("query must not be empty"));
        }
        let k = self.k.unwrap_or(config.retrieval.default_k);
        if k > MAX_K {
            return Err(bad_request(format!("k must be <= {}", MAX_K)));
        }
        let min_score = self.min_score.unwrap_or(config.retrieval.min_score);
        if !min_score.is_finite() {
            return Err(bad_request("minScore must be a finite number"));
        }
        Ok(RetrieveRequest::new(self.query.clone(), k, min_score))
    }

    fn timeout(&self, config: &Config) -> Result<Duration, AppError> {
        let ceiling = config.retrieval.timeout();
        match self.timeout_ms {
            None => Ok(ceiling),
            Some(0) => Err(bad_request("timeoutMs must be > 0")),
            Some(ms) => Ok(Duration::from_millis(ms).min(ceiling)),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveHit {
    path: String,
    source_id: String,
    source_type: SourceType,
    chunk_index: u32,
    version: u64,
    text: String,
    score: f32,
    line_range: LineRange,
}

impl From<RetrievalResult> for RetrieveHit {
    fn from(r: RetrievalResult) -> Self {
        let m = r.metadata;
        Self {
            path: m.path,
            source_id: m.source_id,
            source_type: m.source_type,
            chunk_index: m.chunk_index,
            version: m.version,
            text: m.text,
            score: r.score,
            line_range: m.lines,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveResponse {
    results: Vec<RetrieveHit>,
    took_ms: u64,
}

async fn handle_retrieve(
    State(state): State<AppState>,
    body: Result<Json<QueryBody>, JsonRejection>,
) -> Result<Json<RetrieveResponse>, AppError> {
    let Json(body) = body?;
    let config = state.engine.config();
    let request = body.to_request(config)?;
    let timeout = body.timeout(config)?;

    let started = Instant::now();
    let results = state.engine.retrieve(&request, timeout).await?;

    Ok(Json(RetrieveResponse {
        results: results.into_iter().map(RetrieveHit::from).collect(),
        took_ms: started.elapsed().as_millis() as u64,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContextResponse {
    #[serde(flatten)]
    payload: ContextPayload,
    took_ms: u64,
}

async fn handle_context(
    State(state): State<AppState>,
    body: Result<Json<QueryBody>, JsonRejection>,
) -> Result<Json<ContextResponse>, AppError> {
    let Json(body) = body?;
    let config = state.engine.config();
    let request = body.to_request(config)?;
    let timeout = body.timeout(config)?;
    let budget = body
        .token_budget
        .unwrap_or(config.retrieval.context_token_budget);

    let started = Instant::now();
    let payload = state
        .engine
        .context(&request, budget, timeout)
        .await?;

    Ok(Json(ContextResponse {
        payload,
        took_ms: started.elapsed().as_millis() as u64,
    }))
}

// ============ GET /v1/statistics ============

async fn handle_statistics(State(state): State<AppState>) -> Json<Statistics> {
    Json(state.engine.statistics())
}

// ============ POST /v1/webhook ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookAccepted {
    accepted: usize,
    commit_sha: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookStatus {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    commit_sha: Option<String>,
}

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let receiver = state
        .webhook
        .as_ref()
        .ok_or_else(|| not_found("webhook source is disabled"))?;

    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let outcome = receiver
        .receive(
            header("x-github-event"),
            header("x-hub-signature-256"),
            &body,
        )
        .await
        .map_err(|e| match e {
            WebhookError::Unauthorized => AppError {
                status: StatusCode::UNAUTHORIZED,
                code: "unauthorized",
                message: e.to_string(),
            },
            WebhookError::Malformed(inner) => bad_request(inner.to_string()),
            WebhookError::Unavailable(inner) => unavailable("unavailable", inner.to_string()),
        })?;

    let response = match outcome {
        WebhookOutcome::Accepted {
            commit_sha,
            accepted,
        } => (
            StatusCode::ACCEPTED,
            Json(WebhookAccepted {
                accepted,
                commit_sha,
            }),
        )
            .into_response(),
        WebhookOutcome::Duplicate { commit_sha } => Json(WebhookStatus {
            status: "duplicate".to_string(),
            commit_sha: Some(commit_sha),
        })
        .into_response(),
        WebhookOutcome::Ignored(status) => Json(WebhookStatus {
            status,
            commit_sha: None,
        })
        .into_response(),
    };
    Ok(response)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
