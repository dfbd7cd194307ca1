//! In-memory ledger store.
//!
//! Backs tests and local development. One mutex over all tables gives
//! the per-account linearization the trait demands; contention is not a
//! concern at test scale.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use novavid_shared::{Provider, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::account::{Account, SubscriptionRef};
use crate::error::{LedgerError, LedgerResult};

use super::{
    CreditReason, CustomerLink, DebitApplied, DebitResolution, LedgerEntry, LedgerStore,
    LinkOutcome, ParkedEvent, PlanChange, PlanChangeOutcome, ProcessedEvent, RefundOutcome,
    SettleOutcome,
};

#[derive(Default)]
struct Inner {
    accounts: HashMap<Uuid, Account>,
    entries: Vec<LedgerEntry>,
    processed: HashMap<(Provider, String), ProcessedEvent>,
    parked: Vec<ParkedEvent>,
}

/// In-memory implementation of [`LedgerStore`].
#[derive(Default)]
pub struct MemoryLedgerStore {
    inner: Mutex<Inner>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| LedgerError::Database("ledger store mutex poisoned".to_string()))
    }

    /// Overwrite a balance without touching the ledger. Exists only so
    /// invariant-checker tests can manufacture corrupted state.
    #[cfg(test)]
    pub(crate) fn corrupt_balance(&self, id: Uuid, credits: i64) {
        #[allow(clippy::unwrap_used)]
        let mut inner = self.inner.lock().unwrap();
        if let Some(account) = inner.accounts.get_mut(&id) {
            account.credits = credits;
        }
    }
}

fn check_mutable(account: &Account) -> LedgerResult<()> {
    if account.frozen_at.is_some() {
        return Err(LedgerError::AccountFrozen(account.id));
    }
    if account.closed_at.is_some() {
        return Err(LedgerError::AccountClosed(account.id));
    }
    Ok(())
}

/// Resolution of outstanding holds stays possible on a closed account;
/// only frozen accounts refuse it.
fn check_not_frozen(account: &Account) -> LedgerResult<()> {
    if account.frozen_at.is_some() {
        return Err(LedgerError::AccountFrozen(account.id));
    }
    Ok(())
}

fn find_debit<'a>(
    entries: &'a mut [LedgerEntry],
    account_id: Uuid,
    operation_id: &str,
) -> Option<&'a mut LedgerEntry> {
    entries.iter_mut().find(|e| {
        e.account_id == account_id
            && e.reason == CreditReason::Debit
            && e.operation_id.as_deref() == Some(operation_id)
    })
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_account(&self, account: &Account) -> LedgerResult<()> {
        let mut inner = self.lock()?;
        if inner.accounts.contains_key(&account.id) {
            return Err(LedgerError::AccountExists(account.id));
        }
        if account.credits > 0 {
            inner.entries.push(LedgerEntry {
                id: Uuid::new_v4(),
                account_id: account.id,
                delta: account.credits,
                reason: CreditReason::TrialGrant,
                operation_id: None,
                resolution: None,
                created_at: account.created_at,
            });
        }
        inner.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> LedgerResult<Option<Account>> {
        Ok(self.lock()?.accounts.get(&id).cloned())
    }

    async fn account_ids(&self) -> LedgerResult<Vec<Uuid>> {
        Ok(self.lock()?.accounts.keys().copied().collect())
    }

    async fn find_by_customer(
        &self,
        provider: Provider,
        external_customer_id: &str,
    ) -> LedgerResult<Option<Uuid>> {
        Ok(self
            .lock()?
            .accounts
            .values()
            .find(|a| {
                a.subscription.as_ref().is_some_and(|s| {
                    s.provider == provider && s.external_customer_id == external_customer_id
                })
            })
            .map(|a| a.id))
    }

    async fn find_by_subscription(
        &self,
        provider: Provider,
        external_subscription_id: &str,
    ) -> LedgerResult<Option<Uuid>> {
        Ok(self
            .lock()?
            .accounts
            .values()
            .find(|a| {
                a.subscription.as_ref().is_some_and(|s| {
                    s.provider == provider
                        && s.external_subscription_id == external_subscription_id
                })
            })
            .map(|a| a.id))
    }

    async fn close_account(&self, id: Uuid, now: OffsetDateTime) -> LedgerResult<()> {
        let mut inner = self.lock()?;
        let account = inner
            .accounts
            .get_mut(&id)
            .ok_or(LedgerError::AccountNotFound(id))?;
        if account.closed_at.is_none() {
            account.closed_at = Some(now);
        }
        Ok(())
    }

    async fn freeze_account(
        &self,
        id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<()> {
        let mut inner = self.lock()?;
        let account = inner
            .accounts
            .get_mut(&id)
            .ok_or(LedgerError::AccountNotFound(id))?;
        if account.frozen_at.is_none() {
            account.frozen_at = Some(now);
            account.frozen_reason = Some(reason.to_string());
        }
        Ok(())
    }

    async fn apply_debit(
        &self,
        account_id: Uuid,
        amount: i64,
        operation_id: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<DebitApplied> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let mut inner = self.lock()?;

        // Replay of a client retry: return the prior result unchanged. A
        // debit that was already refunded (sweep or explicit release) must
        // not be silently revived; the caller needs a fresh operation id.
        if let Some(prior) = find_debit(&mut inner.entries, account_id, operation_id) {
            if prior.resolution == Some(DebitResolution::Refunded) {
                return Err(LedgerError::OperationExpired {
                    account_id,
                    operation_id: operation_id.to_string(),
                });
            }
            let amount = -prior.delta;
            let balance = inner
                .accounts
                .get(&account_id)
                .ok_or(LedgerError::AccountNotFound(account_id))?
                .credits;
            return Ok(DebitApplied {
                amount,
                balance,
                replayed: true,
            });
        }

        let account = inner
            .accounts
            .get_mut(&account_id)
            .ok_or(LedgerError::AccountNotFound(account_id))?;
        check_mutable(account)?;
        if account.credits < amount {
            return Err(LedgerError::InsufficientCredits {
                available: account.credits,
                requested: amount,
            });
        }
        account.credits -= amount;
        let balance = account.credits;
        inner.entries.push(LedgerEntry {
            id: Uuid::new_v4(),
            account_id,
            delta: -amount,
            reason: CreditReason::Debit,
            operation_id: Some(operation_id.to_string()),
            resolution: None,
            created_at: now,
        });
        Ok(DebitApplied {
            amount,
            balance,
            replayed: false,
        })
    }

    async fn apply_refund(
        &self,
        account_id: Uuid,
        operation_id: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<RefundOutcome> {
        let mut inner = self.lock()?;
        {
            let account = inner
                .accounts
                .get(&account_id)
                .ok_or(LedgerError::AccountNotFound(account_id))?;
            check_not_frozen(account)?;
        }

        let Some(debit) = find_debit(&mut inner.entries, account_id, operation_id) else {
            return Ok(RefundOutcome::UnknownOperation);
        };
        match debit.resolution {
            Some(DebitResolution::Refunded) => return Ok(RefundOutcome::AlreadyRefunded),
            Some(DebitResolution::Settled) => return Ok(RefundOutcome::AlreadySettled),
            None => {}
        }
        let amount = -debit.delta;
        debit.resolution = Some(DebitResolution::Refunded);

        let account = inner
            .accounts
            .get_mut(&account_id)
            .ok_or(LedgerError::AccountNotFound(account_id))?;
        account.credits += amount;
        let balance = account.credits;
        inner.entries.push(LedgerEntry {
            id: Uuid::new_v4(),
            account_id,
            delta: amount,
            reason: CreditReason::Refund,
            operation_id: Some(operation_id.to_string()),
            resolution: None,
            created_at: now,
        });
        Ok(RefundOutcome::Refunded { amount, balance })
    }

    async fn mark_settled(
        &self,
        account_id: Uuid,
        operation_id: &str,
        _now: OffsetDateTime,
    ) -> LedgerResult<SettleOutcome> {
        let mut inner = self.lock()?;
        {
            let account = inner
                .accounts
                .get(&account_id)
                .ok_or(LedgerError::AccountNotFound(account_id))?;
            check_not_frozen(account)?;
        }
        let Some(debit) = find_debit(&mut inner.entries, account_id, operation_id) else {
            return Ok(SettleOutcome::UnknownOperation);
        };
        match debit.resolution {
            Some(DebitResolution::Settled) => Ok(SettleOutcome::AlreadySettled),
            Some(DebitResolution::Refunded) => Ok(SettleOutcome::AlreadyRefunded),
            None => {
                debit.resolution = Some(DebitResolution::Settled);
                Ok(SettleOutcome::Settled)
            }
        }
    }

    async fn apply_grant(
        &self,
        account_id: Uuid,
        amount: i64,
        reason: CreditReason,
        now: OffsetDateTime,
    ) -> LedgerResult<i64> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let mut inner = self.lock()?;
        let account = inner
            .accounts
            .get_mut(&account_id)
            .ok_or(LedgerError::AccountNotFound(account_id))?;
        check_mutable(account)?;
        account.credits += amount;
        let balance = account.credits;
        inner.entries.push(LedgerEntry {
            id: Uuid::new_v4(),
            account_id,
            delta: amount,
            reason,
            operation_id: None,
            resolution: None,
            created_at: now,
        });
        Ok(balance)
    }

    async fn entries(&self, account_id: Uuid) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self
            .lock()?
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn unresolved_debits_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self
            .lock()?
            .entries
            .iter()
            .filter(|e| {
                e.reason == CreditReason::Debit
                    && e.resolution.is_none()
                    && e.created_at < cutoff
            })
            .cloned()
            .collect())
    }

    async fn is_event_processed(
        &self,
        provider: Provider,
        external_event_id: &str,
    ) -> LedgerResult<bool> {
        Ok(self
            .lock()?
            .processed
            .contains_key(&(provider, external_event_id.to_string())))
    }

    async fn apply_plan_change(&self, change: &PlanChange) -> LedgerResult<PlanChangeOutcome> {
        let mut inner = self.lock()?;
        let key = (change.provider, change.external_event_id.clone());
        if inner.processed.contains_key(&key) {
            return Ok(PlanChangeOutcome::DuplicateIgnored);
        }

        let account = inner
            .accounts
            .get_mut(&change.account_id)
            .ok_or(LedgerError::AccountNotFound(change.account_id))?;
        check_not_frozen(account)?;

        // A late-arriving older event must not clobber newer state. It is
        // still recorded as processed so redelivery stays absorbed.
        if let Some(sub) = &account.subscription {
            if change.event_timestamp < sub.synced_at {
                inner.processed.insert(
                    key,
                    ProcessedEvent {
                        provider: change.provider,
                        external_event_id: change.external_event_id.clone(),
                        outcome: "stale".to_string(),
                        processed_at: OffsetDateTime::now_utc(),
                    },
                );
                return Ok(PlanChangeOutcome::StaleIgnored);
            }
        }

        let from_tier = account.plan_tier;
        account.plan_tier = change.new_tier;
        account.subscription = Some(SubscriptionRef {
            provider: change.provider,
            external_customer_id: change.external_customer_id.clone(),
            external_subscription_id: change.external_subscription_id.clone(),
            status: change.status,
            period_end: change.period_end,
            synced_at: change.event_timestamp,
        });

        // Upgrades may carry a one-time bonus; downgrades never touch the
        // balance.
        let mut bonus_granted = 0;
        if change.new_tier > from_tier && change.upgrade_bonus > 0 {
            account.credits += change.upgrade_bonus;
            bonus_granted = change.upgrade_bonus;
            let account_id = account.id;
            inner.entries.push(LedgerEntry {
                id: Uuid::new_v4(),
                account_id,
                delta: change.upgrade_bonus,
                reason: CreditReason::Grant,
                operation_id: Some(format!("upgrade:{}", change.external_event_id)),
                resolution: None,
                created_at: change.event_timestamp,
            });
        }

        inner.processed.insert(
            key,
            ProcessedEvent {
                provider: change.provider,
                external_event_id: change.external_event_id.clone(),
                outcome: "applied".to_string(),
                processed_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(PlanChangeOutcome::Applied {
            from_tier,
            to_tier: change.new_tier,
            bonus_granted,
        })
    }

    async fn link_customer(&self, link: &CustomerLink) -> LedgerResult<LinkOutcome> {
        let mut inner = self.lock()?;
        let key = (link.provider, link.external_event_id.clone());
        if inner.processed.contains_key(&key) {
            return Ok(LinkOutcome::DuplicateIgnored);
        }

        let account = inner
            .accounts
            .get_mut(&link.account_id)
            .ok_or(LedgerError::AccountNotFound(link.account_id))?;
        check_not_frozen(account)?;

        match &mut account.subscription {
            // A lifecycle event may have landed first via the account
            // hint; only fill in the mapping, never regress state.
            Some(sub) if sub.provider == link.provider => {
                sub.external_customer_id = link.external_customer_id.clone();
                if let Some(sub_id) = &link.external_subscription_id {
                    if sub.external_subscription_id.is_empty() {
                        sub.external_subscription_id = sub_id.clone();
                    }
                }
            }
            _ => {
                // The link carries no subscription status, so it must not
                // advance the staleness watermark: the first status-bearing
                // event has to apply even when its timestamp predates the
                // checkout's.
                account.subscription = Some(SubscriptionRef {
                    provider: link.provider,
                    external_customer_id: link.external_customer_id.clone(),
                    external_subscription_id: link
                        .external_subscription_id
                        .clone()
                        .unwrap_or_default(),
                    status: SubscriptionStatus::PendingApproval,
                    period_end: None,
                    synced_at: OffsetDateTime::UNIX_EPOCH,
                });
            }
        }

        inner.processed.insert(
            key,
            ProcessedEvent {
                provider: link.provider,
                external_event_id: link.external_event_id.clone(),
                outcome: "link".to_string(),
                processed_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(LinkOutcome::Linked)
    }

    async fn park_event(&self, parked: &ParkedEvent) -> LedgerResult<()> {
        let mut inner = self.lock()?;
        let exists = inner.parked.iter().any(|p| {
            p.provider == parked.provider && p.external_event_id == parked.external_event_id
        });
        if !exists {
            inner.parked.push(parked.clone());
        }
        Ok(())
    }

    async fn list_parked(&self, limit: usize) -> LedgerResult<Vec<ParkedEvent>> {
        Ok(self.lock()?.parked.iter().take(limit).cloned().collect())
    }

    async fn delete_parked(&self, id: Uuid) -> LedgerResult<()> {
        self.lock()?.parked.retain(|p| p.id != id);
        Ok(())
    }

    async fn bump_parked_attempts(&self, id: Uuid, _now: OffsetDateTime) -> LedgerResult<()> {
        if let Some(parked) = self.lock()?.parked.iter_mut().find(|p| p.id == id) {
            parked.attempts += 1;
        }
        Ok(())
    }
}
