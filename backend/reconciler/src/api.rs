//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::deposit::NewDeposit;
use crate::errors::ReconcileError;
use crate::notify;
use crate::provisional::NewPledge;
use crate::state::ServiceState;
use crate::{matching, refund, saga};

#[derive(Clone)]
pub struct ApiState {
    pub service: ServiceState,
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DeleteDepositRequest {
    pub admin_id: i64,
}

/// Body of every refund step: who is acting.
#[derive(Deserialize)]
pub struct RefundActionRequest {
    pub user_id: i64,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct AcceptedResponse {
    pub deposit_id: i64,
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Set when an uploaded deposit was stored but not accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposit_id: Option<i64>,
}

fn status_for(e: &ReconcileError) -> StatusCode {
    match e {
        ReconcileError::NotFound { .. } => StatusCode::NOT_FOUND,
        ReconcileError::InvalidTransition { .. }
        | ReconcileError::InvalidStatus { .. }
        | ReconcileError::AlreadyExists { .. }
        | ReconcileError::StaleWrite { .. }
        | ReconcileError::DepositLocked { .. } => StatusCode::CONFLICT,
        ReconcileError::AmountExceeded { .. }
        | ReconcileError::NegativeAmount(_)
        | ReconcileError::Validation(_) => StatusCode::BAD_REQUEST,
        e if e.is_reconcile_outcome() => StatusCode::UNPROCESSABLE_ENTITY,
        ReconcileError::Forbidden(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: ReconcileError) -> Response {
    let deposit_id = match &e {
        ReconcileError::Unmatched { deposit_id, .. }
        | ReconcileError::PartiallyMatched { deposit_id, .. } => Some(*deposit_id),
        _ => None,
    };
    (
        status_for(&e),
        Json(serde_json::json!(ErrorResponse {
            error: e.to_string(),
            deposit_id,
        })),
    )
        .into_response()
}

fn json<T: Serialize>(status: StatusCode, body: T) -> Response {
    (status, Json(serde_json::json!(body))).into_response()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /pledges`
pub async fn create_pledge(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<NewPledge>,
) -> impl IntoResponse {
    match matching::register_pledge(&state.service, body).await {
        Ok(pledge) => json(StatusCode::CREATED, pledge),
        Err(e) => error_response(e),
    }
}

/// `POST /deposits`
///
/// Stores the transfer and reconciles it right away. A deposit that did not
/// match is still stored; the 422 body carries its id.
pub async fn upload_deposit(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<NewDeposit>,
) -> impl IntoResponse {
    match matching::upload_deposit(&state.service, body).await {
        Ok(deposit) => json(StatusCode::CREATED, deposit),
        Err(e) => error_response(e),
    }
}

/// `DELETE /deposits/:id`
///
/// Starts the deletion workflow; poll `GET /deposits/:id/deletion` for the
/// result.
pub async fn delete_deposit(
    State(state): State<Arc<ApiState>>,
    Path(deposit_id): Path<i64>,
    Json(body): Json<DeleteDepositRequest>,
) -> impl IntoResponse {
    match saga::request_delete(&state.service, deposit_id, body.admin_id).await {
        Ok(()) => json(
            StatusCode::ACCEPTED,
            AcceptedResponse {
                deposit_id,
                status: "deletion_requested",
            },
        ),
        Err(e) => error_response(e),
    }
}

/// `GET /deposits/:id/deletion`
pub async fn get_deletion(
    State(state): State<Arc<ApiState>>,
    Path(deposit_id): Path<i64>,
) -> impl IntoResponse {
    match saga::deletion_status(&state.service, deposit_id) {
        Some(workflow) => json(StatusCode::OK, workflow),
        None => error_response(ReconcileError::NotFound {
            entity: "DeletionWorkflow",
            key: deposit_id.to_string(),
        }),
    }
}

/// `POST /donations/:id/refund`
pub async fn request_refund(
    State(state): State<Arc<ApiState>>,
    Path(donation_id): Path<i64>,
    Json(body): Json<RefundActionRequest>,
) -> impl IntoResponse {
    match refund::request_refund(&state.service, donation_id, body.user_id).await {
        Ok(donation) => json(StatusCode::OK, donation),
        Err(e) => error_response(e),
    }
}

/// `POST /donations/:id/refund/cancel`
pub async fn cancel_refund(
    State(state): State<Arc<ApiState>>,
    Path(donation_id): Path<i64>,
    Json(body): Json<RefundActionRequest>,
) -> impl IntoResponse {
    match refund::cancel_refund(&state.service, donation_id, body.user_id).await {
        Ok(donation) => json(StatusCode::OK, donation),
        Err(e) => error_response(e),
    }
}

/// `POST /donations/:id/refund/assign`
pub async fn assign_refund(
    State(state): State<Arc<ApiState>>,
    Path(donation_id): Path<i64>,
    Json(body): Json<RefundActionRequest>,
) -> impl IntoResponse {
    match refund::assign_refund_admin(&state.service, donation_id, body.user_id).await {
        Ok(donation) => json(StatusCode::OK, donation),
        Err(e) => error_response(e),
    }
}

/// `POST /donations/:id/refund/complete`
pub async fn complete_refund(
    State(state): State<Arc<ApiState>>,
    Path(donation_id): Path<i64>,
    Json(body): Json<RefundActionRequest>,
) -> impl IntoResponse {
    match refund::complete_refund(&state.service, donation_id, body.user_id).await {
        Ok(donation) => json(StatusCode::OK, donation),
        Err(e) => error_response(e),
    }
}

/// `GET /users/:id/notifications`
pub async fn get_notifications(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<i64>,
) -> impl IntoResponse {
    let mut conn = match state.service.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return error_response(e.into()),
    };
    match notify::notifications_for(&mut conn, user_id).await {
        Ok(notifications) => json(StatusCode::OK, notifications),
        Err(e) => error_response(e),
    }
}
