//! Account registration and entitlement lookup.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use novavid_ledger::store::LedgerStore;
use novavid_ledger::{resolver, Account, LedgerEntry};
use novavid_shared::{PlanTier, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    /// Account id assigned by the identity service; generated here when
    /// omitted.
    pub account_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub id: Uuid,
    pub plan_tier: PlanTier,
    pub credits: i64,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub subscription_status: Option<SubscriptionStatus>,
    pub frozen: bool,
    pub closed: bool,
    pub created_at: OffsetDateTime,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            plan_tier: account.plan_tier,
            credits: account.credits,
            trial_ends_at: account.trial_ends_at,
            subscription_status: account.subscription.as_ref().map(|s| s.status),
            frozen: account.frozen_at.is_some(),
            closed: account.closed_at.is_some(),
            created_at: account.created_at,
        }
    }
}

/// POST /v1/accounts
pub async fn register<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AccountResponse>)> {
    let id = request.account_id.unwrap_or_else(Uuid::new_v4);
    let account = state.ledger.accounts.register(id).await?;
    Ok((StatusCode::CREATED, Json(account.into())))
}

/// GET /v1/accounts/{id}
pub async fn get_account<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AccountResponse>> {
    let account = state.ledger.accounts.get(id).await?;
    Ok(Json(account.into()))
}

/// GET /v1/accounts/{id}/entitlement
pub async fn entitlement<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<resolver::Entitlement>> {
    let account = state.ledger.accounts.get(id).await?;
    Ok(Json(resolver::resolve(&account, OffsetDateTime::now_utc())))
}

/// GET /v1/accounts/{id}/ledger
pub async fn ledger_entries<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<LedgerEntry>>> {
    // 404 on unknown accounts rather than an empty list.
    state.ledger.accounts.get(id).await?;
    Ok(Json(state.ledger.engine.entries(id).await?))
}

/// POST /v1/accounts/{id}/close
pub async fn close_account<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.ledger.accounts.close(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
