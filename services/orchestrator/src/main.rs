//! Conversion orchestrator service
//!
//! Single-binary Rust service that:
//! 1. Loads the candidate/routing configuration and encrypted credential state
//! 2. Exposes the conversion entry point backed by the fallback executor
//! 3. Runs the quota reset sweep in the background
//! 4. Serves the admin API on a separate listener

mod admin;
mod config;
mod executor;
mod metrics;
mod provider_impl;
mod routing;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use credential_pool::{CredentialPool, PoolConfig, spawn_reset_task};
use credential_store::{CredentialStore, SecretCipher};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::{OperationInput, OperationOutput};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use user_quota::QuotaGuard;

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::executor::{ExecuteError, FallbackExecutor};
use crate::routing::RoutingTable;

/// Shared application state for the conversion listener.
#[derive(Clone)]
struct AppState {
    executor: Arc<FallbackExecutor>,
    pool: Arc<CredentialPool>,
    prometheus: PrometheusHandle,
}

/// Build the conversion router with health and metrics endpoints.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/convert", post(convert_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting convert-orchestrator");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.orchestrator.listen_addr,
        admin_addr = %config.orchestrator.admin_addr,
        candidates = config.candidates.len(),
        operations = config.operations.len(),
        "configuration loaded"
    );

    // Credential encryption key comes from the environment, never the config
    let cipher = SecretCipher::from_env()
        .context("credential encryption key missing or invalid (CREDENTIAL_KEK_BASE64)")?;

    tokio::fs::create_dir_all(&config.orchestrator.state_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create state dir {}",
                config.orchestrator.state_dir.display()
            )
        })?;

    let store = Arc::new(
        CredentialStore::load(
            config.orchestrator.state_dir.join("pool-state.json"),
            cipher,
        )
        .await
        .context("failed to load credential state")?,
    );
    let pool = Arc::new(CredentialPool::new(
        store,
        PoolConfig {
            safety_threshold: config.pool.safety_threshold,
            preemptive_fraction: config.pool.preemptive_fraction,
            reset_horizon_millis: config.pool.reset_horizon_secs * 1000,
        },
    ));
    let guard = Arc::new(
        QuotaGuard::load(
            config.orchestrator.state_dir.join("user-quota.json"),
            config.user_quota.default_legacy_limit,
        )
        .await
        .context("failed to load user quota state")?,
    );

    let http_client = reqwest::Client::new();
    let candidates = provider_impl::build_candidates(&config.candidates, http_client);
    let candidate_names: HashSet<String> = candidates.keys().cloned().collect();

    let routing = Arc::new(RoutingTable::new(config.operations.clone()));
    let executor = Arc::new(FallbackExecutor::new(
        routing.clone(),
        candidates,
        pool.clone(),
        guard.clone(),
    ));

    // Periodic quota reset sweep, independent of the request path
    let reset_handle = spawn_reset_task(
        pool.clone(),
        Duration::from_secs(config.pool.reset_interval_secs),
    );

    // Admin API on its own listener
    let admin_state = AdminState::new(pool.clone(), guard, routing, candidate_names);
    let admin_listener = TcpListener::bind(config.orchestrator.admin_addr)
        .await
        .with_context(|| format!("failed to bind admin to {}", config.orchestrator.admin_addr))?;
    info!(addr = %config.orchestrator.admin_addr, "admin API listening");
    let admin_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(admin_listener, build_admin_router(admin_state)).await {
            tracing::error!(error = %e, "admin listener failed");
        }
    });

    let app_state = AppState {
        executor,
        pool,
        prometheus: prometheus_handle,
    };
    let app = build_router(app_state, config.orchestrator.max_connections);

    let listener = TcpListener::bind(config.orchestrator.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.orchestrator.listen_addr))?;
    info!(addr = %config.orchestrator.listen_addr, "accepting conversion requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down");
    reset_handle.abort();
    admin_task.abort();
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Conversion request body.
///
/// Request validation and caller authentication live in the outer API
/// layer; this endpoint trusts `owner` and only checks what it needs to
/// run the chain.
#[derive(Deserialize)]
struct ConvertRequest {
    owner: String,
    operation: String,
    filename: String,
    /// Document bytes, base64-encoded
    document: String,
    #[serde(default)]
    source_format: Option<String>,
    #[serde(default)]
    target_format: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    options: serde_json::Value,
}

/// POST /convert — run one conversion through the fallback chain.
async fn convert_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<ConvertRequest>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
    let document = match BASE64.decode(body.document.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "error": { "type": "invalid_input", "message": format!("document is not valid base64: {e}"), "request_id": request_id }
                }),
            );
        }
    };

    let input = OperationInput {
        operation: body.operation.clone(),
        document,
        filename: body.filename,
        source_format: body.source_format,
        target_format: body.target_format,
        language: body.language,
        options: body.options,
    };

    let started = std::time::Instant::now();
    let result = state
        .executor
        .execute(&body.owner, &body.operation, input)
        .await;
    metrics::record_duration(&body.operation, started.elapsed().as_secs_f64());

    match result {
        Ok(conversion) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "request_id": request_id,
                "technology_used": conversion.technology_used,
                "quality": conversion.quality,
                "kind": conversion.kind,
                "result": output_json(conversion.output),
            }),
        ),
        Err(err) => {
            let (status, body) = error_body(&err, &request_id);
            json_response(status, body)
        }
    }
}

/// Render the tagged output for the JSON response, with file bytes
/// base64-encoded.
fn output_json(output: OperationOutput) -> serde_json::Value {
    match output {
        OperationOutput::Text { content } => {
            serde_json::json!({ "type": "text", "content": content })
        }
        OperationOutput::File { bytes, format } => serde_json::json!({
            "type": "file",
            "format": format,
            "document": BASE64.encode(bytes),
        }),
        OperationOutput::Structured { value } => {
            serde_json::json!({ "type": "structured", "value": value })
        }
    }
}

/// Map executor errors onto the three user-visible outcomes: an upgrade
/// prompt, a caller-fixable input error, or an aggregated "no available
/// method" failure. Provider secrets never appear in any of them.
fn error_body(err: &ExecuteError, request_id: &str) -> (StatusCode, serde_json::Value) {
    match err {
        ExecuteError::UnknownOperation(op) => (
            StatusCode::NOT_FOUND,
            serde_json::json!({
                "error": { "type": "unknown_operation", "message": format!("no such operation: {op}"), "request_id": request_id }
            }),
        ),
        ExecuteError::QuotaExceeded(user_quota::Error::QuotaExceeded {
            limit,
            used,
            resets_in_days,
            plan,
            suggestion,
        }) => (
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({
                "error": {
                    "type": "quota_exceeded",
                    "message": suggestion,
                    "limit": limit,
                    "used": used,
                    "resets_in_days": resets_in_days,
                    "plan": plan,
                    "request_id": request_id,
                }
            }),
        ),
        ExecuteError::QuotaExceeded(other) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({
                "error": { "type": "internal", "message": other.to_string(), "request_id": request_id }
            }),
        ),
        ExecuteError::InvalidInput(detail) => (
            StatusCode::BAD_REQUEST,
            serde_json::json!({
                "error": { "type": "invalid_input", "message": detail, "request_id": request_id }
            }),
        ),
        ExecuteError::AllCandidatesFailed { operation, attempts } => (
            StatusCode::BAD_GATEWAY,
            serde_json::json!({
                "error": {
                    "type": "all_candidates_failed",
                    "message": "could not process this file with any available method",
                    "operation": operation,
                    "attempts": attempts,
                    "request_id": request_id,
                }
            }),
        ),
        ExecuteError::UnknownCandidate { .. } | ExecuteError::Internal(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({
                "error": { "type": "internal", "message": err.to_string(), "request_id": request_id }
            }),
        ),
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /healthz — pool health plus service liveness.
async fn health_handler(State(state): State<AppState>) -> Response {
    let pool_health = state.pool.health().await;
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "ok",
            "pool": pool_health,
        }),
    )
}

/// GET /metrics — Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        state.prometheus.render(),
    )
        .into_response()
}
