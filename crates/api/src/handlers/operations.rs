//! Reserve / release / settle endpoints for metered work.
//!
//! Render workers call reserve before starting a job and settle or
//! release when it finishes. All three are idempotent under the
//! caller-supplied operation id, so a worker that times out can safely
//! retry the same call.

use axum::extract::{Path, State};
use axum::Json;
use novavid_ledger::store::LedgerStore;
use novavid_ledger::{RefundOutcome, SettleOutcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub account_id: Uuid,
    pub amount: i64,
    pub operation_id: String,
}

#[derive(Debug, Serialize)]
pub struct ReserveResponse {
    pub account_id: Uuid,
    pub operation_id: String,
    pub amount: i64,
    pub balance: i64,
    pub replayed: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub account_id: Uuid,
}

/// POST /v1/operations/reserve
pub async fn reserve<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<ReserveRequest>,
) -> ApiResult<Json<ReserveResponse>> {
    let reservation = state
        .ledger
        .engine
        .reserve(request.account_id, request.amount, &request.operation_id)
        .await?;
    Ok(Json(ReserveResponse {
        account_id: reservation.account_id,
        operation_id: reservation.operation_id,
        amount: reservation.amount,
        balance: reservation.balance,
        replayed: reservation.replayed,
    }))
}

/// POST /v1/operations/{operation_id}/release
pub async fn release<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Path(operation_id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state
        .ledger
        .engine
        .release(request.account_id, &operation_id)
        .await?;

    let body = match outcome {
        RefundOutcome::Refunded { amount, balance } => serde_json::json!({
            "outcome": "refunded", "amount": amount, "balance": balance
        }),
        RefundOutcome::AlreadyRefunded => serde_json::json!({ "outcome": "already_refunded" }),
        RefundOutcome::AlreadySettled => serde_json::json!({ "outcome": "already_settled" }),
        RefundOutcome::UnknownOperation => serde_json::json!({ "outcome": "unknown_operation" }),
    };
    Ok(Json(body))
}

/// POST /v1/operations/{operation_id}/settle
pub async fn settle<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Path(operation_id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state
        .ledger
        .engine
        .settle(request.account_id, &operation_id)
        .await?;

    let body = match outcome {
        SettleOutcome::Settled => serde_json::json!({ "outcome": "settled" }),
        SettleOutcome::AlreadySettled => serde_json::json!({ "outcome": "already_settled" }),
        SettleOutcome::AlreadyRefunded => serde_json::json!({ "outcome": "already_refunded" }),
        SettleOutcome::UnknownOperation => serde_json::json!({ "outcome": "unknown_operation" }),
    };
    Ok(Json(body))
}
