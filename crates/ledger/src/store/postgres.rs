//! Postgres-backed ledger store.
//!
//! Every mutating method runs in a transaction with the account row
//! locked via `SELECT ... FOR UPDATE`, which gives the per-account
//! linearization the trait requires. Event idempotency uses
//! `INSERT ... ON CONFLICT DO NOTHING RETURNING` so only one concurrent
//! delivery of an event id can claim it.

use std::str::FromStr;

use async_trait::async_trait;
use novavid_shared::{PlanTier, Provider, SubscriptionStatus};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::account::{Account, SubscriptionRef};
use crate::error::{LedgerError, LedgerResult};

use super::{
    CreditReason, CustomerLink, DebitApplied, DebitResolution, LedgerEntry, LedgerStore,
    LinkOutcome, ParkedEvent, PlanChange, PlanChangeOutcome, RefundOutcome, SettleOutcome,
};

/// Postgres implementation of [`LedgerStore`].
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the bundled migrations.
    pub async fn migrate(&self) -> LedgerResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))
    }

    async fn lock_account(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> LedgerResult<Account> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT id, plan_tier, credits, trial_ends_at,
                   provider, external_customer_id, external_subscription_id,
                   subscription_status, period_end, synced_at,
                   frozen_at, frozen_reason, closed_at, created_at
            FROM accounts
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        row.ok_or(LedgerError::AccountNotFound(id))?.into_account()
    }
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    plan_tier: String,
    credits: i64,
    trial_ends_at: Option<OffsetDateTime>,
    provider: Option<String>,
    external_customer_id: Option<String>,
    external_subscription_id: Option<String>,
    subscription_status: Option<String>,
    period_end: Option<OffsetDateTime>,
    synced_at: Option<OffsetDateTime>,
    frozen_at: Option<OffsetDateTime>,
    frozen_reason: Option<String>,
    closed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl AccountRow {
    fn into_account(self) -> LedgerResult<Account> {
        let plan_tier = PlanTier::from_str(&self.plan_tier)
            .map_err(|e| LedgerError::Database(e.to_string()))?;

        let subscription = match (
            self.provider,
            self.external_customer_id,
            self.subscription_status,
            self.synced_at,
        ) {
            (Some(provider), Some(customer), Some(status), Some(synced_at)) => {
                Some(SubscriptionRef {
                    provider: Provider::from_str(&provider)
                        .map_err(|e| LedgerError::Database(e.to_string()))?,
                    external_customer_id: customer,
                    external_subscription_id: self.external_subscription_id.unwrap_or_default(),
                    status: SubscriptionStatus::from_str(&status)
                        .map_err(|e| LedgerError::Database(e.to_string()))?,
                    period_end: self.period_end,
                    synced_at,
                })
            }
            _ => None,
        };

        Ok(Account {
            id: self.id,
            plan_tier,
            credits: self.credits,
            trial_ends_at: self.trial_ends_at,
            subscription,
            frozen_at: self.frozen_at,
            frozen_reason: self.frozen_reason,
            closed_at: self.closed_at,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: Uuid,
    account_id: Uuid,
    delta: i64,
    reason: String,
    operation_id: Option<String>,
    resolution: Option<String>,
    created_at: OffsetDateTime,
}

impl EntryRow {
    fn into_entry(self) -> LedgerResult<LedgerEntry> {
        let reason = match self.reason.as_str() {
            "debit" => CreditReason::Debit,
            "refund" => CreditReason::Refund,
            "grant" => CreditReason::Grant,
            "trial_grant" => CreditReason::TrialGrant,
            other => {
                return Err(LedgerError::Database(format!(
                    "unknown ledger entry reason: {other}"
                )))
            }
        };
        let resolution = match self.resolution.as_deref() {
            None => None,
            Some("settled") => Some(DebitResolution::Settled),
            Some("refunded") => Some(DebitResolution::Refunded),
            Some(other) => {
                return Err(LedgerError::Database(format!(
                    "unknown debit resolution: {other}"
                )))
            }
        };
        Ok(LedgerEntry {
            id: self.id,
            account_id: self.account_id,
            delta: self.delta,
            reason,
            operation_id: self.operation_id,
            resolution,
            created_at: self.created_at,
        })
    }
}

fn ensure_mutable(account: &Account) -> LedgerResult<()> {
    if account.frozen_at.is_some() {
        return Err(LedgerError::AccountFrozen(account.id));
    }
    if account.closed_at.is_some() {
        return Err(LedgerError::AccountClosed(account.id));
    }
    Ok(())
}

fn ensure_not_frozen(account: &Account) -> LedgerResult<()> {
    if account.frozen_at.is_some() {
        return Err(LedgerError::AccountFrozen(account.id));
    }
    Ok(())
}

async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    delta: i64,
    reason: CreditReason,
    operation_id: Option<&str>,
    created_at: OffsetDateTime,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ledger_entries (id, account_id, delta, reason, operation_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(account_id)
    .bind(delta)
    .bind(reason.to_string())
    .bind(operation_id)
    .bind(created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Claim an event id for processing. Returns false when another delivery
/// already holds it.
async fn claim_event(
    tx: &mut Transaction<'_, Postgres>,
    provider: Provider,
    external_event_id: &str,
    outcome: &str,
) -> LedgerResult<bool> {
    let claimed: Option<(String,)> = sqlx::query_as(
        r#"
        INSERT INTO processed_events (provider, external_event_id, outcome, processed_at)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (provider, external_event_id) DO NOTHING
        RETURNING external_event_id
        "#,
    )
    .bind(provider.to_string())
    .bind(external_event_id)
    .bind(outcome)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(claimed.is_some())
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert_account(&self, account: &Account) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO accounts (id, plan_tier, credits, trial_ends_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(account.id)
        .bind(account.plan_tier.to_string())
        .bind(account.credits)
        .bind(account.trial_ends_at)
        .bind(account.created_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(LedgerError::AccountExists(account.id));
        }

        if account.credits > 0 {
            insert_entry(
                &mut tx,
                account.id,
                account.credits,
                CreditReason::TrialGrant,
                None,
                account.created_at,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> LedgerResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT id, plan_tier, credits, trial_ends_at,
                   provider, external_customer_id, external_subscription_id,
                   subscription_status, period_end, synced_at,
                   frozen_at, frozen_reason, closed_at, created_at
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AccountRow::into_account).transpose()
    }

    async fn account_ids(&self) -> LedgerResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM accounts ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn find_by_customer(
        &self,
        provider: Provider,
        external_customer_id: &str,
    ) -> LedgerResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM accounts WHERE provider = $1 AND external_customer_id = $2",
        )
        .bind(provider.to_string())
        .bind(external_customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn find_by_subscription(
        &self,
        provider: Provider,
        external_subscription_id: &str,
    ) -> LedgerResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM accounts WHERE provider = $1 AND external_subscription_id = $2",
        )
        .bind(provider.to_string())
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn close_account(&self, id: Uuid, now: OffsetDateTime) -> LedgerResult<()> {
        let updated = sqlx::query(
            "UPDATE accounts SET closed_at = COALESCE(closed_at, $2) WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound(id));
        }
        Ok(())
    }

    async fn freeze_account(
        &self,
        id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE accounts
            SET frozen_at = COALESCE(frozen_at, $2),
                frozen_reason = COALESCE(frozen_reason, $3)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound(id));
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
        let mut tx = self.pool.begin().await?;
        let account = self.lock_account(&mut tx, account_id).await?;

        // Replay of a client retry returns the prior result unchanged. A
        // debit that was already refunded (sweep or explicit release) must
        // not be silently revived; the caller needs a fresh operation id.
        let prior: Option<(i64, Option<String>)> = sqlx::query_as(
            r#"
            SELECT delta, resolution FROM ledger_entries
            WHERE account_id = $1 AND operation_id = $2 AND reason = 'debit'
            "#,
        )
        .bind(account_id)
        .bind(operation_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((delta, resolution)) = prior {
            if resolution.as_deref() == Some("refunded") {
                return Err(LedgerError::OperationExpired {
                    account_id,
                    operation_id: operation_id.to_string(),
                });
            }
            tx.commit().await?;
            return Ok(DebitApplied {
                amount: -delta,
                balance: account.credits,
                replayed: true,
            });
        }

        ensure_mutable(&account)?;
        if account.credits < amount {
            return Err(LedgerError::InsufficientCredits {
                available: account.credits,
                requested: amount,
            });
        }

        sqlx::query("UPDATE accounts SET credits = credits - $2 WHERE id = $1")
            .bind(account_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;
        insert_entry(
            &mut tx,
            account_id,
            -amount,
            CreditReason::Debit,
            Some(operation_id),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(DebitApplied {
            amount,
            balance: account.credits - amount,
            replayed: false,
        })
    }

    async fn apply_refund(
        &self,
        account_id: Uuid,
        operation_id: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<RefundOutcome> {
        let mut tx = self.pool.begin().await?;
        let account = self.lock_account(&mut tx, account_id).await?;
        ensure_not_frozen(&account)?;

        let debit: Option<(Uuid, i64, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, delta, resolution FROM ledger_entries
            WHERE account_id = $1 AND operation_id = $2 AND reason = 'debit'
            "#,
        )
        .bind(account_id)
        .bind(operation_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((debit_id, delta, resolution)) = debit else {
            return Ok(RefundOutcome::UnknownOperation);
        };
        match resolution.as_deref() {
            Some("refunded") => return Ok(RefundOutcome::AlreadyRefunded),
            Some("settled") => return Ok(RefundOutcome::AlreadySettled),
            _ => {}
        }

        let amount = -delta;
        sqlx::query("UPDATE ledger_entries SET resolution = 'refunded' WHERE id = $1")
            .bind(debit_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE accounts SET credits = credits + $2 WHERE id = $1")
            .bind(account_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;
        insert_entry(
            &mut tx,
            account_id,
            amount,
            CreditReason::Refund,
            Some(operation_id),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(RefundOutcome::Refunded {
            amount,
            balance: account.credits + amount,
        })
    }

    async fn mark_settled(
        &self,
        account_id: Uuid,
        operation_id: &str,
        _now: OffsetDateTime,
    ) -> LedgerResult<SettleOutcome> {
        let mut tx = self.pool.begin().await?;
        // Take the account row lock first so settle and refund serialize in
        // the same order; a racing sweep cannot refund a settled debit.
        let account = self.lock_account(&mut tx, account_id).await?;
        ensure_not_frozen(&account)?;

        let debit: Option<(Uuid, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, resolution FROM ledger_entries
            WHERE account_id = $1 AND operation_id = $2 AND reason = 'debit'
            "#,
        )
        .bind(account_id)
        .bind(operation_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((debit_id, resolution)) = debit else {
            return Ok(SettleOutcome::UnknownOperation);
        };
        match resolution.as_deref() {
            Some("settled") => return Ok(SettleOutcome::AlreadySettled),
            Some("refunded") => return Ok(SettleOutcome::AlreadyRefunded),
            _ => {}
        }

        sqlx::query("UPDATE ledger_entries SET resolution = 'settled' WHERE id = $1")
            .bind(debit_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(SettleOutcome::Settled)
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
        let mut tx = self.pool.begin().await?;
        let account = self.lock_account(&mut tx, account_id).await?;
        ensure_mutable(&account)?;

        sqlx::query("UPDATE accounts SET credits = credits + $2 WHERE id = $1")
            .bind(account_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;
        insert_entry(&mut tx, account_id, amount, reason, None, now).await?;

        tx.commit().await?;
        Ok(account.credits + amount)
    }

    async fn entries(&self, account_id: Uuid) -> LedgerResult<Vec<LedgerEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            r#"
            SELECT id, account_id, delta, reason, operation_id, resolution, created_at
            FROM ledger_entries
            WHERE account_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EntryRow::into_entry).collect()
    }

    async fn unresolved_debits_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            r#"
            SELECT id, account_id, delta, reason, operation_id, resolution, created_at
            FROM ledger_entries
            WHERE reason = 'debit' AND resolution IS NULL AND created_at < $1
            ORDER BY created_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EntryRow::into_entry).collect()
    }

    async fn is_event_processed(
        &self,
        provider: Provider,
        external_event_id: &str,
    ) -> LedgerResult<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT outcome FROM processed_events
            WHERE provider = $1 AND external_event_id = $2
            "#,
        )
        .bind(provider.to_string())
        .bind(external_event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn apply_plan_change(&self, change: &PlanChange) -> LedgerResult<PlanChangeOutcome> {
        let mut tx = self.pool.begin().await?;

        if !claim_event(&mut tx, change.provider, &change.external_event_id, "applied").await? {
            return Ok(PlanChangeOutcome::DuplicateIgnored);
        }

        let account = self.lock_account(&mut tx, change.account_id).await?;
        ensure_not_frozen(&account)?;

        // A late-arriving older event must not clobber newer state. The
        // processed-event claim still commits so redelivery stays absorbed.
        if let Some(sub) = &account.subscription {
            if change.event_timestamp < sub.synced_at {
                sqlx::query(
                    r#"
                    UPDATE processed_events SET outcome = 'stale'
                    WHERE provider = $1 AND external_event_id = $2
                    "#,
                )
                .bind(change.provider.to_string())
                .bind(&change.external_event_id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                return Ok(PlanChangeOutcome::StaleIgnored);
            }
        }

        sqlx::query(
            r#"
            UPDATE accounts
            SET plan_tier = $2,
                provider = $3,
                external_customer_id = $4,
                external_subscription_id = $5,
                subscription_status = $6,
                period_end = $7,
                synced_at = $8
            WHERE id = $1
            "#,
        )
        .bind(change.account_id)
        .bind(change.new_tier.to_string())
        .bind(change.provider.to_string())
        .bind(&change.external_customer_id)
        .bind(&change.external_subscription_id)
        .bind(change.status.to_string())
        .bind(change.period_end)
        .bind(change.event_timestamp)
        .execute(&mut *tx)
        .await?;

        // Upgrades may carry a one-time bonus; downgrades never touch the
        // balance.
        let mut bonus_granted = 0;
        if change.new_tier > account.plan_tier && change.upgrade_bonus > 0 {
            sqlx::query("UPDATE accounts SET credits = credits + $2 WHERE id = $1")
                .bind(change.account_id)
                .bind(change.upgrade_bonus)
                .execute(&mut *tx)
                .await?;
            let bonus_op = format!("upgrade:{}", change.external_event_id);
            insert_entry(
                &mut tx,
                change.account_id,
                change.upgrade_bonus,
                CreditReason::Grant,
                Some(&bonus_op),
                change.event_timestamp,
            )
            .await?;
            bonus_granted = change.upgrade_bonus;
        }

        tx.commit().await?;
        Ok(PlanChangeOutcome::Applied {
            from_tier: account.plan_tier,
            to_tier: change.new_tier,
            bonus_granted,
        })
    }

    async fn link_customer(&self, link: &CustomerLink) -> LedgerResult<LinkOutcome> {
        let mut tx = self.pool.begin().await?;

        if !claim_event(&mut tx, link.provider, &link.external_event_id, "link").await? {
            return Ok(LinkOutcome::DuplicateIgnored);
        }

        let account = self.lock_account(&mut tx, link.account_id).await?;
        ensure_not_frozen(&account)?;

        match &account.subscription {
            // A lifecycle event may have landed first via the account hint;
            // only fill in the mapping, never regress state.
            Some(sub) if sub.provider == link.provider => {
                sqlx::query(
                    r#"
                    UPDATE accounts
                    SET external_customer_id = $2,
                        external_subscription_id = COALESCE(
                            NULLIF(external_subscription_id, ''), $3, external_subscription_id
                        )
                    WHERE id = $1
                    "#,
                )
                .bind(link.account_id)
                .bind(&link.external_customer_id)
                .bind(&link.external_subscription_id)
                .execute(&mut *tx)
                .await?;
            }
            _ => {
                sqlx::query(
                    r#"
                    UPDATE accounts
                    SET provider = $2,
                        external_customer_id = $3,
                        external_subscription_id = $4,
                        subscription_status = $5,
                        period_end = NULL,
                        synced_at = $6
                    WHERE id = $1
                    "#,
                )
                .bind(link.account_id)
                .bind(link.provider.to_string())
                .bind(&link.external_customer_id)
                .bind(link.external_subscription_id.clone().unwrap_or_default())
                .bind(SubscriptionStatus::PendingApproval.to_string())
                // The link carries no subscription status, so it must not
                // advance the staleness watermark: the first status-bearing
                // event has to apply even when its timestamp predates the
                // checkout's.
                .bind(OffsetDateTime::UNIX_EPOCH)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(LinkOutcome::Linked)
    }

    async fn park_event(&self, parked: &ParkedEvent) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO parked_events (id, provider, external_event_id, payload, attempts, parked_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (provider, external_event_id) DO NOTHING
            "#,
        )
        .bind(parked.id)
        .bind(parked.provider.to_string())
        .bind(&parked.external_event_id)
        .bind(&parked.payload)
        .bind(parked.attempts)
        .bind(parked.parked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_parked(&self, limit: usize) -> LedgerResult<Vec<ParkedEvent>> {
        let rows: Vec<(Uuid, String, String, serde_json::Value, i32, OffsetDateTime)> =
            sqlx::query_as(
                r#"
                SELECT id, provider, external_event_id, payload, attempts, parked_at
                FROM parked_events
                ORDER BY parked_at
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|(id, provider, external_event_id, payload, attempts, parked_at)| {
                Ok(ParkedEvent {
                    id,
                    provider: Provider::from_str(&provider)
                        .map_err(|e| LedgerError::Database(e.to_string()))?,
                    external_event_id,
                    payload,
                    attempts,
                    parked_at,
                })
            })
            .collect()
    }

    async fn delete_parked(&self, id: Uuid) -> LedgerResult<()> {
        sqlx::query("DELETE FROM parked_events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bump_parked_attempts(&self, id: Uuid, now: OffsetDateTime) -> LedgerResult<()> {
        sqlx::query(
            "UPDATE parked_events SET attempts = attempts + 1, last_attempt_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
