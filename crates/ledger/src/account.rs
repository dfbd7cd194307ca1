//! Account model and registration.
//!
//! One `Account` per end user: plan tier, credit balance, trial window,
//! and the reference to whichever provider subscription currently backs
//! the tier. The tier is only ever written by the webhook reconciler or
//! an explicit admin action, never by client-facing code.

use std::sync::Arc;

use novavid_shared::{PlanTier, Provider, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::store::LedgerStore;

/// Reference to the external subscription backing an account's tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRef {
    pub provider: Provider,
    pub external_customer_id: String,
    pub external_subscription_id: String,
    pub status: SubscriptionStatus,
    pub period_end: Option<OffsetDateTime>,
    /// Timestamp of the most recent provider event applied to this
    /// subscription. Events older than this are stale and ignored.
    pub synced_at: OffsetDateTime,
}

/// Durable per-user billing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub plan_tier: PlanTier,
    /// Spendable credit balance. Never negative.
    pub credits: i64,
    /// While `now < trial_ends_at` the effective tier is Pro.
    pub trial_ends_at: Option<OffsetDateTime>,
    pub subscription: Option<SubscriptionRef>,
    /// Set when an invariant violation was observed; all mutation refused
    /// until manual reconciliation clears it.
    pub frozen_at: Option<OffsetDateTime>,
    pub frozen_reason: Option<String>,
    /// Soft-close marker. Accounts with an active subscription are never
    /// hard-deleted.
    pub closed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Account {
    /// Build a freshly registered account: free tier, signup credits, and
    /// a trial window starting now.
    pub fn register(id: Uuid, config: &LedgerConfig, now: OffsetDateTime) -> Self {
        Self {
            id,
            plan_tier: PlanTier::Free,
            credits: config.signup_credits,
            trial_ends_at: Some(now + Duration::days(config.trial_days)),
            subscription: None,
            frozen_at: None,
            frozen_reason: None,
            closed_at: None,
            created_at: now,
        }
    }

    /// Whether mutation is currently allowed on this account.
    pub fn is_mutable(&self) -> bool {
        self.frozen_at.is_none() && self.closed_at.is_none()
    }
}

/// Registration and lookup operations over the account store.
pub struct AccountService<S> {
    store: Arc<S>,
    config: Arc<LedgerConfig>,
}

impl<S> Clone for AccountService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: LedgerStore> AccountService<S> {
    pub fn new(store: Arc<S>, config: Arc<LedgerConfig>) -> Self {
        Self { store, config }
    }

    /// Register a new account with the signup grant and trial window.
    ///
    /// The signup grant is recorded as a `TrialGrant` ledger entry in the
    /// same atomic insert, so `sum(deltas) == credits` holds from the
    /// first moment of the account's life.
    pub async fn register(&self, id: Uuid) -> LedgerResult<Account> {
        let now = OffsetDateTime::now_utc();
        let account = Account::register(id, &self.config, now);
        self.store.insert_account(&account).await?;

        tracing::info!(
            account_id = %account.id,
            credits = account.credits,
            trial_ends_at = ?account.trial_ends_at,
            "Account registered with signup grant"
        );
        Ok(account)
    }

    /// Fetch an account by id.
    pub async fn get(&self, id: Uuid) -> LedgerResult<Account> {
        self.store
            .get_account(id)
            .await?
            .ok_or(LedgerError::AccountNotFound(id))
    }

    /// Soft-close an account. The record is kept while a subscription
    /// reference exists so late provider events still resolve.
    pub async fn close(&self, id: Uuid) -> LedgerResult<()> {
        let now = OffsetDateTime::now_utc();
        self.store.close_account(id, now).await?;
        tracing::info!(account_id = %id, "Account soft-closed");
        Ok(())
    }
}
