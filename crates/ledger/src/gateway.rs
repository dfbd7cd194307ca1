//! Metered operation gateway.
//!
//! The one entry point client-facing code uses to run credit-costed
//! work: reserve, run, then settle on success or release on failure.
//! Charging is exactly-once per operation id even though the work itself
//! is at-least-once under retries.

use std::future::Future;
use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use novavid_shared::PlanTier;

use crate::config::LedgerConfig;
use crate::engine::LedgerEngine;
use crate::error::{LedgerError, LedgerResult};
use crate::resolver;
use crate::store::{CreditReason, LedgerStore};

/// Runs metered work under the reserve / settle / release lifecycle.
pub struct MeteredGateway<S> {
    store: Arc<S>,
    engine: LedgerEngine<S>,
    config: Arc<LedgerConfig>,
}

impl<S> Clone for MeteredGateway<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            engine: self.engine.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: LedgerStore> MeteredGateway<S> {
    pub fn new(store: Arc<S>, config: Arc<LedgerConfig>) -> Self {
        Self {
            engine: LedgerEngine::new(Arc::clone(&store)),
            store,
            config,
        }
    }

    /// Reserve `cost` credits, run `work`, and resolve the reservation.
    ///
    /// Success settles the debit so the sweep will never refund it;
    /// failure releases it and surfaces [`LedgerError::WorkFailure`].
    /// Pro accounts running low are topped up first when the recharge is
    /// enabled.
    pub async fn with_credits<T, E, F, Fut>(
        &self,
        account_id: Uuid,
        cost: i64,
        operation_id: &str,
        work: F,
    ) -> LedgerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.maybe_recharge(account_id, cost).await?;

        let reservation = self.engine.reserve(account_id, cost, operation_id).await?;

        match work().await {
            Ok(value) => {
                self.engine.settle(account_id, operation_id).await?;
                tracing::debug!(
                    account_id = %account_id,
                    operation_id = %operation_id,
                    amount = reservation.amount,
                    "Metered work settled"
                );
                Ok(value)
            }
            Err(e) => {
                self.engine.release(account_id, operation_id).await?;
                Err(LedgerError::WorkFailure(e.to_string()))
            }
        }
    }

    /// Top up a Pro account that cannot cover `cost`. The grant lands in
    /// the ledger like any other, so the audit invariant still holds.
    async fn maybe_recharge(&self, account_id: Uuid, cost: i64) -> LedgerResult<()> {
        if !self.config.pro_recharge_enabled {
            return Ok(());
        }
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(account_id))?;
        let now = OffsetDateTime::now_utc();
        if resolver::effective_tier(&account, now) != PlanTier::Pro {
            return Ok(());
        }
        if account.credits >= cost {
            return Ok(());
        }

        let balance = self
            .engine
            .grant(account_id, self.config.pro_recharge_amount, CreditReason::Grant)
            .await?;
        tracing::info!(
            account_id = %account_id,
            amount = self.config.pro_recharge_amount,
            balance,
            "Pro account recharged"
        );
        Ok(())
    }
}
