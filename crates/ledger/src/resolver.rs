//! Effective plan resolution.
//!
//! Pure functions from account state plus "now" to the entitlement a
//! client should see. The stored tier is what the reconciler last wrote;
//! the effective tier layers the trial window on top. Nothing here
//! touches the store.

use novavid_shared::{PlanLimits, PlanTier};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::account::Account;

/// The client-facing view of what an account may do right now.
#[derive(Debug, Clone, Serialize)]
pub struct Entitlement {
    pub account_id: Uuid,
    /// Tier the account is actually entitled to at this instant.
    pub effective_tier: PlanTier,
    /// Tier written by the reconciler, before the trial overlay.
    pub base_tier: PlanTier,
    pub trial_active: bool,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub credits: i64,
    pub limits: PlanLimits,
}

/// Whether the signup trial is currently active.
pub fn trial_active(account: &Account, now: OffsetDateTime) -> bool {
    account.closed_at.is_none()
        && account
            .trial_ends_at
            .is_some_and(|ends_at| now < ends_at)
}

/// Resolve the tier an account is entitled to at `now`.
///
/// An active trial grants Pro regardless of the stored tier; when the
/// trial lapses the stored tier takes over with no further action. A
/// closed account resolves to Free.
pub fn effective_tier(account: &Account, now: OffsetDateTime) -> PlanTier {
    if account.closed_at.is_some() {
        return PlanTier::Free;
    }
    if trial_active(account, now) {
        return PlanTier::Pro;
    }
    account.plan_tier
}

/// Build the full entitlement view for an account.
pub fn resolve(account: &Account, now: OffsetDateTime) -> Entitlement {
    let tier = effective_tier(account, now);
    Entitlement {
        account_id: account.id,
        effective_tier: tier,
        base_tier: account.plan_tier,
        trial_active: trial_active(account, now),
        trial_ends_at: account.trial_ends_at,
        credits: account.credits,
        limits: tier.limits(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use time::Duration;

    fn fresh_account(now: OffsetDateTime) -> Account {
        Account::register(Uuid::new_v4(), &LedgerConfig::default(), now)
    }

    #[test]
    fn test_new_account_is_pro_during_trial() {
        let now = OffsetDateTime::now_utc();
        let account = fresh_account(now);

        let entitlement = resolve(&account, now + Duration::days(4));
        assert_eq!(entitlement.effective_tier, PlanTier::Pro);
        assert_eq!(entitlement.base_tier, PlanTier::Free);
        assert!(entitlement.trial_active);
        assert_eq!(entitlement.limits.max_video_duration_secs, 18);
    }

    #[test]
    fn test_trial_lapse_reverts_to_stored_tier() {
        let now = OffsetDateTime::now_utc();
        let account = fresh_account(now);

        // One second past the trial boundary.
        let after = now + Duration::days(5) + Duration::seconds(1);
        let entitlement = resolve(&account, after);
        assert_eq!(entitlement.effective_tier, PlanTier::Free);
        assert!(!entitlement.trial_active);
        assert_eq!(entitlement.limits.max_video_duration_secs, 8);
    }

    #[test]
    fn test_trial_boundary_is_exclusive() {
        let now = OffsetDateTime::now_utc();
        let account = fresh_account(now);

        // Exactly at trial_ends_at the trial is over.
        let boundary = now + Duration::days(5);
        assert_eq!(effective_tier(&account, boundary), PlanTier::Free);
    }

    #[test]
    fn test_paid_tier_survives_trial_overlay() {
        let now = OffsetDateTime::now_utc();
        let mut account = fresh_account(now);
        account.plan_tier = PlanTier::Premium;

        // During trial the higher Pro entitlement wins.
        assert_eq!(effective_tier(&account, now), PlanTier::Pro);
        // After trial the paid tier stands.
        let after = now + Duration::days(6);
        assert_eq!(effective_tier(&account, after), PlanTier::Premium);
    }

    #[test]
    fn test_closed_account_resolves_free() {
        let now = OffsetDateTime::now_utc();
        let mut account = fresh_account(now);
        account.plan_tier = PlanTier::Pro;
        account.closed_at = Some(now);

        assert_eq!(effective_tier(&account, now), PlanTier::Free);
        assert!(!trial_active(&account, now));
    }
}
