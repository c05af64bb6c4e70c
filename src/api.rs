//! HTTP surface: status endpoints, operator actions, and the SMS reply webhook.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::{Error, WorkflowError};
use crate::workflow::{ReplyTarget, WorkflowEngine, WorkflowState};

/// Records returned by the list endpoints.
const LIST_LIMIT: usize = 100;

type ApiResponse = (StatusCode, Json<Value>);

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub started_at: Instant,
}

/// Build the Axum router with workflow and webhook routes.
pub fn workflow_routes(engine: Arc<WorkflowEngine>) -> Router {
    let state = AppState {
        engine,
        started_at: Instant::now(),
    };

    Router::new()
        .route("/health", get(health))
        .route("/workflows/stats", get(stats))
        .route("/workflows/awaiting", get(list_awaiting))
        .route("/workflows/failed", get(list_failed))
        .route("/workflows/{item_id}", get(get_workflow))
        .route("/workflows/{item_id}/log", get(get_log))
        .route("/workflows/{item_id}/retry", post(retry_workflow))
        .route("/workflows/{item_id}/timeout", post(timeout_workflow))
        .route("/sms/incoming", post(sms_incoming))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(err: Error) -> ApiResponse {
    let status = match &err {
        Error::Workflow(WorkflowError::UnknownItem { .. }) => StatusCode::NOT_FOUND,
        Error::Workflow(WorkflowError::InvalidState { .. })
        | Error::Workflow(WorkflowError::DuplicateItem { .. })
        | Error::Workflow(WorkflowError::DuplicateReply { .. }) => StatusCode::CONFLICT,
        _ => {
            error!(error = %err, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() })))
}

// ── Health & status ─────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> ApiResponse {
    match state.engine.stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "reply-relay",
                "uptime_secs": state.started_at.elapsed().as_secs(),
                "workflows": stats,
            })),
        ),
        Err(e) => {
            error!(error = %e, "Health check could not read the store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "error": e.to_string() })),
            )
        }
    }
}

async fn stats(State(state): State<AppState>) -> ApiResponse {
    match state.engine.stats().await {
        Ok(stats) => (StatusCode::OK, Json(json!(stats))),
        Err(e) => error_response(e),
    }
}

async fn list_in_state(state: &AppState, wanted: WorkflowState) -> ApiResponse {
    match state.engine.list_by_state(wanted, LIST_LIMIT).await {
        Ok(records) => (
            StatusCode::OK,
            Json(json!({ "count": records.len(), "workflows": records })),
        ),
        Err(e) => error_response(e),
    }
}

async fn list_awaiting(State(state): State<AppState>) -> ApiResponse {
    list_in_state(&state, WorkflowState::AwaitingReply).await
}

async fn list_failed(State(state): State<AppState>) -> ApiResponse {
    list_in_state(&state, WorkflowState::Failed).await
}

// ── Single workflow ─────────────────────────────────────────────────────

async fn get_workflow(State(state): State<AppState>, Path(item_id): Path<String>) -> ApiResponse {
    match state.engine.get(&item_id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(json!(record))),
        Ok(None) => error_response(WorkflowError::UnknownItem { item_id }.into()),
        Err(e) => error_response(e),
    }
}

async fn get_log(State(state): State<AppState>, Path(item_id): Path<String>) -> ApiResponse {
    match state.engine.get(&item_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(WorkflowError::UnknownItem { item_id }.into()),
        Err(e) => return error_response(e),
    }
    match state.engine.transition_log(&item_id).await {
        Ok(entries) => (
            StatusCode::OK,
            Json(json!({ "item_id": item_id, "entries": entries })),
        ),
        Err(e) => error_response(e),
    }
}

/// Re-arm a failed workflow. The drive runs in the background.
async fn retry_workflow(State(state): State<AppState>, Path(item_id): Path<String>) -> ApiResponse {
    match state.engine.get(&item_id).await {
        Ok(Some(record)) if record.state == WorkflowState::Failed => {}
        Ok(Some(record)) => {
            return error_response(
                WorkflowError::InvalidState {
                    item_id,
                    state: record.state,
                    expected: WorkflowState::Failed,
                }
                .into(),
            );
        }
        Ok(None) => return error_response(WorkflowError::UnknownItem { item_id }.into()),
        Err(e) => return error_response(e),
    }

    let engine = Arc::clone(&state.engine);
    let id = item_id.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.retry_failed(&id).await {
            warn!(item_id = %id, error = %e, "Manual retry did not run");
        }
    });

    info!(item_id = %item_id, "Manual retry requested");
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "retrying", "item_id": item_id })),
    )
}

async fn timeout_workflow(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
) -> ApiResponse {
    match state.engine.force_timeout(&item_id).await {
        Ok(record) => (
            StatusCode::OK,
            Json(json!({ "status": "timed_out", "item_id": record.item_id })),
        ),
        Err(e) => error_response(e),
    }
}

// ── SMS webhook ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IncomingSms {
    phone_number: String,
    message: String,
    #[serde(default)]
    item_id: Option<String>,
    /// Gateway message id; identifies redeliveries of the same SMS.
    #[serde(default, alias = "messageId")]
    message_id: Option<String>,
}

fn already_handled(item_id: &str, state: Option<WorkflowState>) -> ApiResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "already_handled",
            "item_id": item_id,
            "state": state,
        })),
    )
}

/// Route a human reply to its workflow.
///
/// Channel retries of an already-applied reply are answered with
/// `already_handled` and HTTP 200 so the gateway stops redelivering. A reply
/// that names no item is routed by [`WorkflowEngine::reply_target`].
async fn sms_incoming(State(state): State<AppState>, Json(sms): Json<IncomingSms>) -> ApiResponse {
    let engine = &state.engine;

    if sms.phone_number.trim() != engine.config().recipient {
        warn!(phone_number = %sms.phone_number, "SMS from unknown number");
        return (
            StatusCode::OK,
            Json(json!({ "status": "ignored", "reason": "unknown phone number" })),
        );
    }

    let reply_key = sms
        .message_id
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty());

    if let Some(key) = reply_key {
        match engine.reply_owner(key).await {
            Ok(Some(owner)) => {
                info!(reply_key = key, item_id = %owner, "Redelivered reply ignored");
                let state = engine.get(&owner).await.ok().flatten().map(|r| r.state);
                return already_handled(&owner, state);
            }
            Ok(None) => {}
            Err(e) => return error_response(e),
        }
    }

    let item_id = match sms.item_id {
        Some(id) => id,
        None => match engine.reply_target(reply_key.is_some()).await {
            Ok(ReplyTarget::Record(record)) => record.item_id,
            Ok(ReplyTarget::Nothing) => {
                info!("Reply received with nothing awaiting one");
                engine.notify_nothing_pending().await;
                return (StatusCode::OK, Json(json!({ "status": "no_pending" })));
            }
            Ok(ReplyTarget::Ambiguous { waiting }) => {
                warn!(waiting, "Reply without item or message id; not routed");
                engine.notify_unroutable(waiting).await;
                return (
                    StatusCode::OK,
                    Json(json!({ "status": "ambiguous", "waiting": waiting })),
                );
            }
            Err(e) => return error_response(e),
        },
    };

    match engine
        .accept_keyed_reply(&item_id, &sms.message, reply_key)
        .await
    {
        Ok(record) => {
            if record.state.needs_drive() {
                let engine = Arc::clone(engine);
                let id = item_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.drive_item(&id).await {
                        error!(item_id = %id, error = %e, "Drive after reply failed");
                    }
                });
            }
            (
                StatusCode::OK,
                Json(json!({
                    "status": "accepted",
                    "item_id": item_id,
                    "state": record.state,
                })),
            )
        }
        Err(Error::Workflow(WorkflowError::InvalidState { state, .. })) => {
            warn!(item_id = %item_id, state = %state, "Reply for a workflow not awaiting one");
            already_handled(&item_id, Some(state))
        }
        Err(Error::Workflow(WorkflowError::DuplicateReply { item_id, .. })) => {
            info!(item_id = %item_id, "Redelivered reply ignored");
            let state = engine.get(&item_id).await.ok().flatten().map(|r| r.state);
            already_handled(&item_id, state)
        }
        Err(e) => error_response(e),
    }
}
