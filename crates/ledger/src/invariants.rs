//! Ledger invariant checks.
//!
//! Runnable consistency checks over accounts and their ledgers. Checks
//! only read; `run_and_enforce` additionally freezes accounts implicated
//! in critical violations so no further mutation can compound the
//! damage. Violations carry enough context to debug from the log line
//! alone.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use novavid_shared::PlanTier;

use crate::account::Account;
use crate::config::LedgerConfig;
use crate::error::LedgerResult;
use crate::store::{CreditReason, LedgerEntry, LedgerStore};

/// A single invariant violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated.
    pub invariant: String,
    /// Accounts affected.
    pub account_ids: Vec<Uuid>,
    /// Human-readable description of the violation.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// The ledger may be charging incorrectly. Affected accounts are
    /// frozen by `run_and_enforce`.
    Critical,
    /// Data inconsistency that needs attention.
    High,
    /// Potential issue, should investigate.
    Medium,
    /// Minor inconsistency, informational.
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of one full invariant run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const CHECKS: &[&str] = &[
    "non_negative_balance",
    "ledger_sum_matches_balance",
    "paid_tier_backed_by_subscription",
    "single_signup_grant",
    "debits_carry_operation_id",
    "unresolved_debit_backlog",
];

/// Runs consistency checks over the whole ledger.
pub struct InvariantChecker<S> {
    store: Arc<S>,
    config: Arc<LedgerConfig>,
}

impl<S> Clone for InvariantChecker<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: LedgerStore> InvariantChecker<S> {
    pub fn new(store: Arc<S>, config: Arc<LedgerConfig>) -> Self {
        Self { store, config }
    }

    /// Names of all available checks.
    pub fn available_checks() -> &'static [&'static str] {
        CHECKS
    }

    /// Run every check and return the summary. Read-only.
    pub async fn run_all_checks(&self) -> LedgerResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for account_id in self.store.account_ids().await? {
            let Some(account) = self.store.get_account(account_id).await? else {
                continue;
            };
            let entries = self.store.entries(account_id).await?;

            violations.extend(check_non_negative_balance(&account));
            violations.extend(check_ledger_sum(&account, &entries));
            violations.extend(check_paid_tier_backed(&account));
            violations.extend(check_single_signup_grant(&account, &entries));
            violations.extend(check_debits_carry_operation_id(&account, &entries));
        }
        violations.extend(self.check_unresolved_backlog(now).await?);

        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();

        let summary = InvariantCheckSummary {
            checked_at: now,
            checks_run: CHECKS.len(),
            checks_passed: CHECKS.len() - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        };

        if summary.healthy {
            tracing::info!(checks_run = summary.checks_run, "All ledger invariants hold");
        } else {
            for violation in &summary.violations {
                tracing::error!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    account_ids = ?violation.account_ids,
                    "{}",
                    violation.description
                );
            }
        }
        Ok(summary)
    }

    /// Run every check, then freeze accounts implicated in critical
    /// violations so further mutation is refused until manual
    /// reconciliation.
    pub async fn run_and_enforce(&self) -> LedgerResult<InvariantCheckSummary> {
        let summary = self.run_all_checks().await?;
        let now = OffsetDateTime::now_utc();

        for violation in &summary.violations {
            if violation.severity != ViolationSeverity::Critical {
                continue;
            }
            for account_id in &violation.account_ids {
                self.store
                    .freeze_account(*account_id, &violation.invariant, now)
                    .await?;
                tracing::error!(
                    account_id = %account_id,
                    invariant = %violation.invariant,
                    "Account frozen pending manual reconciliation"
                );
            }
        }
        Ok(summary)
    }

    /// Unresolved debits far older than the TTL mean the sweep is not
    /// keeping up or is failing.
    async fn check_unresolved_backlog(
        &self,
        now: OffsetDateTime,
    ) -> LedgerResult<Vec<InvariantViolation>> {
        let ttl = Duration::try_from(self.config.reservation_ttl)
            .unwrap_or(Duration::hours(1));
        let cutoff = now - ttl * 2;
        let stale = self.store.unresolved_debits_before(cutoff).await?;
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let mut account_ids: Vec<Uuid> = stale.iter().map(|e| e.account_id).collect();
        account_ids.sort_unstable();
        account_ids.dedup();

        Ok(vec![InvariantViolation {
            invariant: "unresolved_debit_backlog".to_string(),
            account_ids,
            description: format!(
                "{} debits unresolved for more than twice the reservation TTL",
                stale.len()
            ),
            context: serde_json::json!({ "count": stale.len() }),
            severity: ViolationSeverity::Medium,
        }])
    }
}

/// Balances are never negative; the debit path forbids it.
fn check_non_negative_balance(account: &Account) -> Option<InvariantViolation> {
    if account.credits >= 0 {
        return None;
    }
    Some(InvariantViolation {
        invariant: "non_negative_balance".to_string(),
        account_ids: vec![account.id],
        description: format!("Account balance is negative: {}", account.credits),
        context: serde_json::json!({ "credits": account.credits }),
        severity: ViolationSeverity::Critical,
    })
}

/// The balance must equal the sum of all ledger deltas; the signup grant
/// is itself an entry, so no offset is needed.
fn check_ledger_sum(account: &Account, entries: &[LedgerEntry]) -> Option<InvariantViolation> {
    let sum: i64 = entries.iter().map(|e| e.delta).sum();
    if sum == account.credits {
        return None;
    }
    Some(InvariantViolation {
        invariant: "ledger_sum_matches_balance".to_string(),
        account_ids: vec![account.id],
        description: format!(
            "Ledger sums to {} but account balance is {}",
            sum, account.credits
        ),
        context: serde_json::json!({
            "ledger_sum": sum,
            "credits": account.credits,
            "entry_count": entries.len(),
        }),
        severity: ViolationSeverity::Critical,
    })
}

/// A paid tier must be backed by an active subscription; any degraded
/// status should already have dropped the tier to Free.
fn check_paid_tier_backed(account: &Account) -> Option<InvariantViolation> {
    if account.plan_tier == PlanTier::Free || account.closed_at.is_some() {
        return None;
    }
    let backed = account
        .subscription
        .as_ref()
        .is_some_and(|sub| sub.status.is_entitled());
    if backed {
        return None;
    }
    Some(InvariantViolation {
        invariant: "paid_tier_backed_by_subscription".to_string(),
        account_ids: vec![account.id],
        description: format!(
            "Account holds tier {} without a live subscription",
            account.plan_tier
        ),
        context: serde_json::json!({
            "plan_tier": account.plan_tier.to_string(),
            "subscription_status": account
                .subscription
                .as_ref()
                .map(|s| s.status.to_string()),
        }),
        severity: ViolationSeverity::High,
    })
}

/// Exactly one signup grant per account.
fn check_single_signup_grant(
    account: &Account,
    entries: &[LedgerEntry],
) -> Option<InvariantViolation> {
    let grants = entries
        .iter()
        .filter(|e| e.reason == CreditReason::TrialGrant)
        .count();
    if grants <= 1 {
        return None;
    }
    Some(InvariantViolation {
        invariant: "single_signup_grant".to_string(),
        account_ids: vec![account.id],
        description: format!("Account has {grants} signup grants (expected at most 1)"),
        context: serde_json::json!({ "grant_count": grants }),
        severity: ViolationSeverity::High,
    })
}

/// Every debit entry must carry its idempotency key, or replays cannot
/// be detected.
fn check_debits_carry_operation_id(
    account: &Account,
    entries: &[LedgerEntry],
) -> Option<InvariantViolation> {
    let missing = entries
        .iter()
        .filter(|e| e.reason == CreditReason::Debit && e.operation_id.is_none())
        .count();
    if missing == 0 {
        return None;
    }
    Some(InvariantViolation {
        invariant: "debits_carry_operation_id".to_string(),
        account_ids: vec![account.id],
        description: format!("{missing} debit entries have no operation id"),
        context: serde_json::json!({ "missing_count": missing }),
        severity: ViolationSeverity::Medium,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLedgerStore;

    fn checker(
        store: &Arc<MemoryLedgerStore>,
    ) -> InvariantChecker<MemoryLedgerStore> {
        InvariantChecker::new(Arc::clone(store), Arc::new(LedgerConfig::default()))
    }

    async fn register(store: &MemoryLedgerStore) -> Uuid {
        let account = Account::register(
            Uuid::new_v4(),
            &LedgerConfig::default(),
            OffsetDateTime::now_utc(),
        );
        store.insert_account(&account).await.unwrap();
        account.id
    }

    #[tokio::test]
    async fn test_healthy_ledger_passes_all_checks() {
        let store = Arc::new(MemoryLedgerStore::new());
        let id = register(&store).await;
        store
            .apply_debit(id, 30, "op-1", OffsetDateTime::now_utc())
            .await
            .unwrap();
        store
            .mark_settled(id, "op-1", OffsetDateTime::now_utc())
            .await
            .unwrap();

        let summary = checker(&store).run_all_checks().await.unwrap();
        assert!(summary.healthy, "violations: {:?}", summary.violations);
        assert_eq!(summary.checks_failed, 0);
    }

    #[tokio::test]
    async fn test_corrupted_balance_is_reported_and_frozen() {
        let store = Arc::new(MemoryLedgerStore::new());
        let id = register(&store).await;
        store.corrupt_balance(id, -40);

        let summary = checker(&store).run_and_enforce().await.unwrap();
        assert!(!summary.healthy);
        assert!(summary
            .violations
            .iter()
            .any(|v| v.invariant == "non_negative_balance"));
        assert!(summary
            .violations
            .iter()
            .any(|v| v.invariant == "ledger_sum_matches_balance"));

        let account = store.get_account(id).await.unwrap().unwrap();
        assert!(account.frozen_at.is_some());
        assert!(!account.is_mutable());
    }

    #[tokio::test]
    async fn test_ledger_sum_mismatch_is_critical() {
        let store = Arc::new(MemoryLedgerStore::new());
        let id = register(&store).await;
        // Balance drifts from the ledger without going negative.
        store.corrupt_balance(id, 150);

        let summary = checker(&store).run_all_checks().await.unwrap();
        let violation = summary
            .violations
            .iter()
            .find(|v| v.invariant == "ledger_sum_matches_balance")
            .unwrap();
        assert_eq!(violation.severity, ViolationSeverity::Critical);
        assert_eq!(violation.account_ids, vec![id]);
    }

    #[tokio::test]
    async fn test_available_checks_listed() {
        assert!(InvariantChecker::<MemoryLedgerStore>::available_checks()
            .contains(&"non_negative_balance"));
        assert_eq!(
            InvariantChecker::<MemoryLedgerStore>::available_checks().len(),
            6
        );
    }
}
