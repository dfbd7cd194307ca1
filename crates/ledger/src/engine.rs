//! Credit reservation engine.
//!
//! The reserve / release / settle lifecycle for metered work. Every
//! operation is keyed by a caller-supplied operation id, so clients and
//! internal retries can safely replay after a timeout without double
//! charging. Transient storage conflicts are retried here with the same
//! key; everything else surfaces to the caller.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::store::{
    CreditReason, LedgerEntry, LedgerStore, RefundOutcome, SettleOutcome,
};

/// A successfully applied reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub account_id: Uuid,
    pub operation_id: String,
    /// Credits debited by this reservation.
    pub amount: i64,
    /// Balance immediately after the debit.
    pub balance: i64,
    /// True when the operation id had already been applied and this call
    /// changed nothing.
    pub replayed: bool,
}

/// Reserve / release / settle operations over the ledger store.
pub struct LedgerEngine<S> {
    store: Arc<S>,
}

impl<S> Clone for LedgerEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

fn conflict_retry() -> impl Iterator<Item = std::time::Duration> {
    ExponentialBackoff::from_millis(10).map(jitter).take(3)
}

fn is_conflict(e: &LedgerError) -> bool {
    matches!(e, LedgerError::StorageConflict(_))
}

impl<S: LedgerStore> LedgerEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Atomically debit `amount` credits under `operation_id`.
    ///
    /// Replaying an operation id returns the original reservation without
    /// debiting again. Replaying one whose debit was already refunded
    /// fails with [`LedgerError::OperationExpired`]; the caller must
    /// reserve under a fresh operation id. Insufficient balance fails with
    /// [`LedgerError::InsufficientCredits`] and changes nothing.
    pub async fn reserve(
        &self,
        account_id: Uuid,
        amount: i64,
        operation_id: &str,
    ) -> LedgerResult<Reservation> {
        let now = OffsetDateTime::now_utc();
        let applied = RetryIf::spawn(
            conflict_retry(),
            || self.store.apply_debit(account_id, amount, operation_id, now),
            is_conflict,
        )
        .await?;

        if applied.replayed {
            tracing::debug!(
                account_id = %account_id,
                operation_id = %operation_id,
                "Reservation replayed, no new debit"
            );
        } else {
            tracing::info!(
                account_id = %account_id,
                operation_id = %operation_id,
                amount = applied.amount,
                balance = applied.balance,
                "Credits reserved"
            );
        }

        Ok(Reservation {
            account_id,
            operation_id: operation_id.to_string(),
            amount: applied.amount,
            balance: applied.balance,
            replayed: applied.replayed,
        })
    }

    /// Refund the reservation under `operation_id`. Idempotent: a second
    /// release, or a release after the sweep already refunded it, is a
    /// no-op. A release after settlement is refused.
    pub async fn release(
        &self,
        account_id: Uuid,
        operation_id: &str,
    ) -> LedgerResult<RefundOutcome> {
        let now = OffsetDateTime::now_utc();
        let outcome = RetryIf::spawn(
            conflict_retry(),
            || self.store.apply_refund(account_id, operation_id, now),
            is_conflict,
        )
        .await?;

        match outcome {
            RefundOutcome::Refunded { amount, balance } => {
                tracing::info!(
                    account_id = %account_id,
                    operation_id = %operation_id,
                    amount,
                    balance,
                    "Reservation released"
                );
            }
            RefundOutcome::AlreadyRefunded => {
                tracing::debug!(
                    account_id = %account_id,
                    operation_id = %operation_id,
                    "Release replayed, reservation already refunded"
                );
            }
            RefundOutcome::AlreadySettled => {
                tracing::warn!(
                    account_id = %account_id,
                    operation_id = %operation_id,
                    "Refusing to release a settled reservation"
                );
            }
            RefundOutcome::UnknownOperation => {}
        }
        Ok(outcome)
    }

    /// Mark the reservation under `operation_id` as settled so the sweep
    /// will not refund it. Idempotent.
    pub async fn settle(
        &self,
        account_id: Uuid,
        operation_id: &str,
    ) -> LedgerResult<SettleOutcome> {
        let now = OffsetDateTime::now_utc();
        RetryIf::spawn(
            conflict_retry(),
            || self.store.mark_settled(account_id, operation_id, now),
            is_conflict,
        )
        .await
    }

    /// Grant credits outside the reservation lifecycle (upgrade bonus,
    /// Pro auto-recharge, admin credit). Returns the new balance.
    pub async fn grant(
        &self,
        account_id: Uuid,
        amount: i64,
        reason: CreditReason,
    ) -> LedgerResult<i64> {
        let now = OffsetDateTime::now_utc();
        let balance = RetryIf::spawn(
            conflict_retry(),
            || self.store.apply_grant(account_id, amount, reason, now),
            is_conflict,
        )
        .await?;
        tracing::info!(
            account_id = %account_id,
            amount,
            reason = %reason,
            balance,
            "Credits granted"
        );
        Ok(balance)
    }

    /// Current spendable balance.
    pub async fn balance(&self, account_id: Uuid) -> LedgerResult<i64> {
        self.store
            .get_account(account_id)
            .await?
            .map(|a| a.credits)
            .ok_or(LedgerError::AccountNotFound(account_id))
    }

    /// Full audit trail for an account, oldest first.
    pub async fn entries(&self, account_id: Uuid) -> LedgerResult<Vec<LedgerEntry>> {
        self.store.entries(account_id).await
    }
}
