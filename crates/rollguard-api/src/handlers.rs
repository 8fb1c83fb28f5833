//! Route handlers.
//!
//! `/health` returns the bare health document; everything under `/api/v1`
//! is wrapped in the `{success, data, error}` envelope.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use rollguard_breaker::CircuitBreaker;
use rollguard_health::HealthDocument;
use rollguard_rollback::{RollbackError, RollbackRequest, RollbackResult};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::AppState;

/// Initiator recorded when the request body names none.
const DEFAULT_INITIATOR: &str = "api";

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health
///
/// Always a document, never an error page: 503 only signals `unhealthy`.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.aggregator.evaluate(&state.deployment).await;
    let status = StatusCode::from_u16(report.http_status()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    (status, Json(HealthDocument::from(&report)))
}

// ── Rollback ───────────────────────────────────────────────────

/// Optional body for a manual rollback.
#[derive(Debug, Default, Deserialize)]
pub struct RollbackBody {
    pub target_release: Option<String>,
    pub reason: Option<String>,
    pub initiated_by: Option<String>,
}

impl RollbackBody {
    fn into_request(self, app_id: &str) -> RollbackRequest {
        let initiated_by = self.initiated_by.as_deref().unwrap_or(DEFAULT_INITIATOR);
        let mut request = RollbackRequest::manual(app_id, initiated_by);
        if let Some(target) = &self.target_release {
            request = request.with_target(target);
        }
        if let Some(reason) = &self.reason {
            request = request.with_reason(reason);
        }
        request
    }
}

fn rollback_response(result: RollbackResult) -> axum::response::Response {
    if result.success {
        ApiResponse::ok(result).into_response()
    } else {
        let error = Some(result.message.clone());
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse {
                success: false,
                data: Some(result),
                error,
            }),
        )
            .into_response()
    }
}

/// POST /api/v1/apps/{app_id}/rollback
pub async fn trigger_rollback(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let Some(orchestrator) = state.orchestrator.as_ref().map(Arc::clone) else {
        return error_response("rollback commands are not configured", StatusCode::SERVICE_UNAVAILABLE)
            .into_response();
    };

    let body: RollbackBody = if body.iter().all(u8::is_ascii_whitespace) {
        RollbackBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(e) => {
                return error_response(&format!("invalid request body: {e}"), StatusCode::BAD_REQUEST)
                    .into_response();
            }
        }
    };
    let request = body.into_request(&app_id);
    if let Err(e) = request.validate() {
        warn!(%app_id, error = %e, "rollback request rejected");
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response();
    }
    info!(%app_id, initiated_by = %request.initiated_by, "rollback requested");

    // Detached so a client disconnect cannot abort a remote rebuild mid-way.
    let task = {
        let request = request.clone();
        let cancel = state.shutdown.clone();
        tokio::spawn(async move { orchestrator.rollback(request, cancel).await })
    };

    match task.await {
        Ok(Ok(result)) => rollback_response(result),
        Ok(Err(RollbackError::RollbackInProgress { .. })) => {
            error_response("rollback already in progress", StatusCode::CONFLICT).into_response()
        }
        Ok(Err(e)) => {
            error!(%app_id, error = %e, "rollback aborted");
            rollback_response(RollbackResult::failed(&request, &e))
        }
        Err(e) => {
            error!(%app_id, error = %e, "rollback task failed");
            error_response(&format!("rollback task failed: {e}"), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response()
        }
    }
}

// ── Circuits ───────────────────────────────────────────────────

fn breaker(state: &AppState, key: &str) -> CircuitBreaker {
    CircuitBreaker::new(key, state.breaker, Arc::clone(&state.store))
}

/// GET /api/v1/circuits/{key}
pub async fn get_circuit(State(state): State<AppState>, Path(key): Path<String>) -> impl IntoResponse {
    ApiResponse::ok(breaker(&state, &key).snapshot())
}

/// DELETE /api/v1/circuits/{key}
pub async fn reset_circuit(State(state): State<AppState>, Path(key): Path<String>) -> impl IntoResponse {
    if breaker(&state, &key).reset() {
        warn!(circuit = %key, "circuit reset via api");
        ApiResponse::ok("reset").into_response()
    } else {
        error_response("circuit not found", StatusCode::NOT_FOUND).into_response()
    }
}
