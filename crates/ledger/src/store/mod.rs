//! Durable state behind the ledger.
//!
//! The `LedgerStore` trait is the per-account serialization point: every
//! method that mutates an account is atomic with respect to the others
//! for that account. Two concurrent debits racing for the last credits
//! see exactly one winner. Cross-account operations never contend.
//!
//! Two implementations: `PgLedgerStore` (Postgres row locks inside a
//! transaction) for production, `MemoryLedgerStore` (one mutex over the
//! tables) for tests and local development.

mod memory;
mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use novavid_shared::{PlanTier, Provider, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::account::Account;
use crate::error::LedgerResult;

/// Why a ledger entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    /// Client-originated reservation debit.
    Debit,
    /// Refund of a reservation whose work failed or timed out.
    Refund,
    /// Upgrade bonus, admin credit, or Pro auto-recharge.
    Grant,
    /// The one-time signup grant.
    TrialGrant,
}

impl std::fmt::Display for CreditReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreditReason::Debit => write!(f, "debit"),
            CreditReason::Refund => write!(f, "refund"),
            CreditReason::Grant => write!(f, "grant"),
            CreditReason::TrialGrant => write!(f, "trial_grant"),
        }
    }
}

/// How a debit entry was eventually resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebitResolution {
    /// The metered work succeeded; the charge stands.
    Settled,
    /// The debit was refunded (work failed, or the sweep timed it out).
    Refunded,
}

/// Append-only audit record of a credit mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Signed credit delta: negative for debits, positive otherwise.
    pub delta: i64,
    pub reason: CreditReason,
    /// Idempotency key for client-originated debits and their refunds.
    pub operation_id: Option<String>,
    /// Resolution state, set on debit entries only.
    pub resolution: Option<DebitResolution>,
    pub created_at: OffsetDateTime,
}

/// Record that a provider event has been applied. The idempotency record
/// for at-least-once webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub provider: Provider,
    pub external_event_id: String,
    /// What happened when the event was first seen: `applied`, `stale`,
    /// or `link`. For audit only; uniqueness is what matters.
    pub outcome: String,
    pub processed_at: OffsetDateTime,
}

/// An event that arrived before its customer mapping existed, held for
/// retry by the background worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedEvent {
    pub id: Uuid,
    pub provider: Provider,
    pub external_event_id: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub parked_at: OffsetDateTime,
}

/// A normalized subscription change ready to be applied atomically:
/// processed-event record, tier write, and any upgrade bonus happen
/// together or not at all.
#[derive(Debug, Clone)]
pub struct PlanChange {
    pub provider: Provider,
    pub external_event_id: String,
    /// Provider-side event timestamp; drives out-of-order rejection.
    pub event_timestamp: OffsetDateTime,
    pub account_id: Uuid,
    pub external_customer_id: String,
    pub external_subscription_id: String,
    pub status: SubscriptionStatus,
    pub new_tier: PlanTier,
    pub period_end: Option<OffsetDateTime>,
    /// Granted only when `new_tier` is strictly above the current tier.
    pub upgrade_bonus: i64,
}

/// Installs the provider-customer -> account mapping, from a checkout
/// completion event. Resolves the race where lifecycle events can arrive
/// before the mapping exists.
#[derive(Debug, Clone)]
pub struct CustomerLink {
    pub provider: Provider,
    pub external_event_id: String,
    pub event_timestamp: OffsetDateTime,
    pub account_id: Uuid,
    pub external_customer_id: String,
    pub external_subscription_id: Option<String>,
}

/// Result of an atomic debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebitApplied {
    /// Amount actually debited (the original amount on a replay).
    pub amount: i64,
    /// Balance after the debit.
    pub balance: i64,
    /// True when this operation id had already been applied and no new
    /// debit happened.
    pub replayed: bool,
}

/// Result of an atomic refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded { amount: i64, balance: i64 },
    /// The debit was already refunded; nothing changed.
    AlreadyRefunded,
    /// The debit was already settled; refusing to refund a completed
    /// charge.
    AlreadySettled,
    /// No debit entry exists for this operation id.
    UnknownOperation,
}

/// Result of marking a debit settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    Settled,
    AlreadySettled,
    /// The sweep (or an explicit release) refunded this debit first.
    AlreadyRefunded,
    UnknownOperation,
}

/// Result of an atomic plan change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanChangeOutcome {
    Applied {
        from_tier: PlanTier,
        to_tier: PlanTier,
        bonus_granted: i64,
    },
    /// The event id was already processed.
    DuplicateIgnored,
    /// The event is older than the last applied one for this account.
    StaleIgnored,
}

/// Result of installing a customer mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked,
    DuplicateIgnored,
}

/// Durable store for accounts, ledger entries, and processed events.
///
/// Implementations must guarantee that each mutating method is atomic and
/// that mutations for one account are linearized. Methods return
/// `LedgerError::StorageConflict` for transient contention; callers retry
/// with the same idempotency key.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    // -- accounts ---------------------------------------------------------

    /// Insert a new account. When the account carries initial credits, a
    /// `TrialGrant` entry is written in the same atomic step.
    async fn insert_account(&self, account: &Account) -> LedgerResult<()>;

    async fn get_account(&self, id: Uuid) -> LedgerResult<Option<Account>>;

    /// All account ids, for invariant sweeps.
    async fn account_ids(&self) -> LedgerResult<Vec<Uuid>>;

    async fn find_by_customer(
        &self,
        provider: Provider,
        external_customer_id: &str,
    ) -> LedgerResult<Option<Uuid>>;

    async fn find_by_subscription(
        &self,
        provider: Provider,
        external_subscription_id: &str,
    ) -> LedgerResult<Option<Uuid>>;

    async fn close_account(&self, id: Uuid, now: OffsetDateTime) -> LedgerResult<()>;

    /// Halt all further mutation for an account after an invariant
    /// violation was observed.
    async fn freeze_account(
        &self,
        id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<()>;

    // -- credit mutations -------------------------------------------------

    /// Atomically check `credits >= amount`, decrement, and append a
    /// `Debit` entry keyed by `operation_id`. A replayed operation id
    /// returns the prior result without debiting again, unless the debit
    /// was already refunded, which fails with
    /// `LedgerError::OperationExpired`. Insufficient balance returns
    /// `LedgerError::InsufficientCredits`.
    async fn apply_debit(
        &self,
        account_id: Uuid,
        amount: i64,
        operation_id: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<DebitApplied>;

    /// Atomically refund the debit keyed by `operation_id`: increment
    /// credits by the debited amount, append a `Refund` entry, and mark
    /// the debit refunded. Idempotent.
    async fn apply_refund(
        &self,
        account_id: Uuid,
        operation_id: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<RefundOutcome>;

    /// Mark the debit keyed by `operation_id` as settled so the sweep
    /// will not refund it. Idempotent.
    async fn mark_settled(
        &self,
        account_id: Uuid,
        operation_id: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<SettleOutcome>;

    /// Unconditionally increment credits and append an entry. Returns the
    /// new balance.
    async fn apply_grant(
        &self,
        account_id: Uuid,
        amount: i64,
        reason: CreditReason,
        now: OffsetDateTime,
    ) -> LedgerResult<i64>;

    // -- ledger entries ---------------------------------------------------

    async fn entries(&self, account_id: Uuid) -> LedgerResult<Vec<LedgerEntry>>;

    /// Debit entries with no resolution created before `cutoff`;
    /// candidates for the auto-refund sweep.
    async fn unresolved_debits_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> LedgerResult<Vec<LedgerEntry>>;

    // -- provider events --------------------------------------------------

    async fn is_event_processed(
        &self,
        provider: Provider,
        external_event_id: &str,
    ) -> LedgerResult<bool>;

    /// Apply a subscription change: record the event as processed, write
    /// the new tier and subscription reference, and grant any upgrade
    /// bonus, all atomically. Duplicate event ids and events older than
    /// the account's `synced_at` are absorbed without a tier write.
    async fn apply_plan_change(&self, change: &PlanChange) -> LedgerResult<PlanChangeOutcome>;

    /// Install the customer -> account mapping from a checkout completion
    /// event, recording the event as processed in the same step.
    async fn link_customer(&self, link: &CustomerLink) -> LedgerResult<LinkOutcome>;

    // -- parked events ----------------------------------------------------

    async fn park_event(&self, parked: &ParkedEvent) -> LedgerResult<()>;

    async fn list_parked(&self, limit: usize) -> LedgerResult<Vec<ParkedEvent>>;

    async fn delete_parked(&self, id: Uuid) -> LedgerResult<()>;

    async fn bump_parked_attempts(&self, id: Uuid, now: OffsetDateTime) -> LedgerResult<()>;
}
