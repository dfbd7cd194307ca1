//! Operational endpoints: invariant checks, sweep, parked-event retry.
//!
//! These back the same jobs the worker runs on a schedule, exposed for
//! on-demand runs during incident response. Deployment keeps this
//! surface behind the internal ingress.

use axum::extract::State;
use axum::Json;
use novavid_ledger::store::LedgerStore;
use novavid_ledger::InvariantCheckSummary;

use crate::error::ApiResult;
use crate::state::AppState;

/// GET /v1/admin/invariants
pub async fn run_invariants<S: LedgerStore>(
    State(state): State<AppState<S>>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    Ok(Json(state.ledger.invariants.run_all_checks().await?))
}

/// POST /v1/admin/invariants/enforce
pub async fn enforce_invariants<S: LedgerStore>(
    State(state): State<AppState<S>>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    Ok(Json(state.ledger.invariants.run_and_enforce().await?))
}

/// POST /v1/admin/sweep
pub async fn sweep<S: LedgerStore>(
    State(state): State<AppState<S>>,
) -> ApiResult<Json<serde_json::Value>> {
    let report = state.ledger.sweeper.refund_stale().await?;
    Ok(Json(serde_json::json!({
        "examined": report.examined,
        "refunded": report.refunded,
        "skipped": report.skipped,
    })))
}

/// POST /v1/admin/parked/retry
pub async fn retry_parked<S: LedgerStore>(
    State(state): State<AppState<S>>,
) -> ApiResult<Json<serde_json::Value>> {
    let report = state.ledger.reconciler.retry_parked(100).await?;
    Ok(Json(serde_json::json!({
        "retried": report.retried,
        "applied": report.applied,
        "still_parked": report.still_parked,
        "dropped": report.dropped,
    })))
}
