//! Admin API for pool, routing, and subscription management
//!
//! Runs on a separate listener port and provides the operator surface:
//! credential lifecycle, manual rotation, runtime routing edits, and
//! subscription plan changes. Credential secrets are accepted on create
//! and never returned by any endpoint.
//!
//! Endpoints:
//! - GET    /admin/credentials          — list credentials with status (no secrets)
//! - POST   /admin/credentials          — create a credential
//! - DELETE /admin/credentials/{id}     — revoke a credential (rotates away)
//! - POST   /admin/credentials/{id}/rotate — manual rotation with a reason
//! - GET    /admin/pool                 — pool health summary
//! - GET    /admin/routing              — current per-operation candidate lists
//! - PUT    /admin/routing/{operation}  — replace one operation's list
//! - POST   /admin/routing/reset        — restore config-file defaults
//! - POST   /admin/subscriptions/{owner}/plan — upgrade/downgrade a plan
//! - GET    /admin/usage                — recent usage and rotation events

use std::collections::HashSet;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use common::Secret;
use credential_pool::CredentialPool;
use credential_store::{NewCredential, RotationReason};
use serde::Deserialize;
use tracing::{info, warn};
use user_quota::QuotaGuard;

use crate::routing::RoutingTable;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<CredentialPool>,
    guard: Arc<QuotaGuard>,
    routing: Arc<RoutingTable>,
    /// Registered candidate names, for routing validation
    candidate_names: Arc<HashSet<String>>,
}

impl AdminState {
    pub fn new(
        pool: Arc<CredentialPool>,
        guard: Arc<QuotaGuard>,
        routing: Arc<RoutingTable>,
        candidate_names: HashSet<String>,
    ) -> Self {
        Self {
            pool,
            guard,
            routing,
            candidate_names: Arc::new(candidate_names),
        }
    }
}

/// Build the admin axum router with all management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/credentials", get(list_credentials))
        .route("/admin/credentials", post(create_credential))
        .route("/admin/credentials/{id}", delete(revoke_credential))
        .route("/admin/credentials/{id}/rotate", post(rotate_credential))
        .route("/admin/pool", get(pool_status))
        .route("/admin/routing", get(get_routing))
        .route("/admin/routing/reset", post(reset_routing))
        .route("/admin/routing/{operation}", put(update_routing))
        .route("/admin/subscriptions/{owner}/plan", post(change_plan))
        .route("/admin/usage", get(usage_report))
        .with_state(state)
}

/// JSON response helper used by every handler.
fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /admin/credentials — credential list from the pool health view.
///
/// Never exposes secrets, encrypted or otherwise.
async fn list_credentials(State(state): State<AdminState>) -> Response {
    let health = state.pool.health().await;
    let credentials = health
        .get("credentials")
        .cloned()
        .unwrap_or(serde_json::json!([]));
    json_response(StatusCode::OK, serde_json::json!({ "credentials": credentials }))
}

/// Request body for credential creation.
#[derive(Deserialize)]
struct CreateCredentialRequest {
    name: String,
    provider: String,
    secret: String,
    #[serde(default = "default_priority")]
    priority: u32,
    monthly_limit: u64,
    #[serde(default)]
    daily_limit: Option<u64>,
    #[serde(default)]
    notes: Option<String>,
}

fn default_priority() -> u32 {
    1
}

/// POST /admin/credentials — create a credential.
///
/// The plaintext secret is encrypted by the store before it touches
/// disk; the response echoes everything except the secret.
async fn create_credential(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<CreateCredentialRequest>,
) -> Response {
    let record = match state
        .pool
        .store()
        .add(NewCredential {
            name: body.name,
            provider: body.provider,
            secret: Secret::new(body.secret),
            priority: body.priority,
            monthly_limit: body.monthly_limit,
            daily_limit: body.daily_limit,
            notes: body.notes,
        })
        .await
    {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "failed to create credential");
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": format!("failed to create credential: {e}") }),
            );
        }
    };

    info!(
        credential_id = record.id,
        provider = record.provider,
        "credential created"
    );
    json_response(
        StatusCode::CREATED,
        serde_json::json!({
            "id": record.id,
            "name": record.name,
            "provider": record.provider,
            "priority": record.priority,
            "monthly_limit": record.monthly.limit,
            "daily_limit": record.daily.limit,
        }),
    )
}

/// DELETE /admin/credentials/{id} — revoke a credential.
///
/// Revocation is terminal; the pool rotates to a replacement when one
/// exists and records the hand-off either way.
async fn revoke_credential(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.pool.rotate(&id, RotationReason::Revoked, "admin").await {
        Ok(replacement) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "credential_id": id,
                "status": "revoked",
                "replacement": replacement.map(|r| r.id),
            }),
        ),
        Err(credential_pool::Error::NotFound(_)) => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": format!("credential {id} not found") }),
        ),
        Err(e) => {
            warn!(credential_id = id, error = %e, "revocation failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": format!("revocation failed: {e}") }),
            )
        }
    }
}

/// Request body for manual rotation.
#[derive(Deserialize)]
struct RotateRequest {
    reason: RotationReason,
}

/// POST /admin/credentials/{id}/rotate — manually trigger rotation.
async fn rotate_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    axum::Json(body): axum::Json<RotateRequest>,
) -> Response {
    match state.pool.rotate(&id, body.reason, "admin").await {
        Ok(replacement) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "credential_id": id,
                "reason": body.reason.label(),
                "replacement": replacement.map(|r| r.id),
            }),
        ),
        Err(credential_pool::Error::NotFound(_)) => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": format!("credential {id} not found") }),
        ),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": format!("rotation failed: {e}") }),
        ),
    }
}

/// GET /admin/pool — pool health summary.
async fn pool_status(State(state): State<AdminState>) -> Response {
    let health = state.pool.health().await;
    json_response(StatusCode::OK, health)
}

/// GET /admin/routing — the live routing table.
async fn get_routing(State(state): State<AdminState>) -> Response {
    let routes = state.routing.all().await;
    json_response(
        StatusCode::OK,
        serde_json::to_value(routes).unwrap_or(serde_json::Value::Null),
    )
}

/// Request body for a routing update.
#[derive(Deserialize)]
struct UpdateRoutingRequest {
    candidates: Vec<String>,
}

/// PUT /admin/routing/{operation} — replace one operation's candidate
/// list. Applies to new requests only.
async fn update_routing(
    State(state): State<AdminState>,
    Path(operation): Path<String>,
    axum::Json(body): axum::Json<UpdateRoutingRequest>,
) -> Response {
    if body.candidates.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "candidate list must not be empty" }),
        );
    }
    for name in &body.candidates {
        if !state.candidate_names.contains(name) {
            return json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": format!("unknown candidate: {name}") }),
            );
        }
    }

    state.routing.update(&operation, body.candidates.clone()).await;
    json_response(
        StatusCode::OK,
        serde_json::json!({ "operation": operation, "candidates": body.candidates }),
    )
}

/// POST /admin/routing/reset — restore the config-file defaults.
async fn reset_routing(State(state): State<AdminState>) -> Response {
    state.routing.reset_to_defaults().await;
    let routes = state.routing.all().await;
    json_response(
        StatusCode::OK,
        serde_json::to_value(routes).unwrap_or(serde_json::Value::Null),
    )
}

/// Request body for a plan change.
#[derive(Deserialize)]
struct ChangePlanRequest {
    plan: String,
    monthly_limit: u64,
}

/// POST /admin/subscriptions/{owner}/plan — replace the owner's plan.
/// The usage counter restarts at zero.
async fn change_plan(
    State(state): State<AdminState>,
    Path(owner): Path<String>,
    axum::Json(body): axum::Json<ChangePlanRequest>,
) -> Response {
    match state
        .guard
        .upgrade_plan(&owner, &body.plan, body.monthly_limit)
        .await
    {
        Ok(subscription) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "owner": subscription.owner,
                "plan": subscription.plan,
                "monthly_limit": subscription.monthly_limit,
                "used": subscription.used,
            }),
        ),
        Err(e) => {
            warn!(owner, error = %e, "plan change failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": format!("plan change failed: {e}") }),
            )
        }
    }
}

/// GET /admin/usage — recent usage records and rotation events.
async fn usage_report(State(state): State<AdminState>) -> Response {
    let store = state.pool.store();
    let usage = store.usage_records(100).await;
    let rotations = store.rotation_events(50).await;
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "usage": usage,
            "rotations": rotations,
        }),
    )
}
