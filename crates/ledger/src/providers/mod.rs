//! Provider event normalization.
//!
//! Each payment provider delivers its own webhook shape; the reconciler
//! only ever sees the normalized forms defined here. Parsing is pure:
//! payload in, `NormalizedEvent` out, `MalformedEvent` on anything the
//! reconciler could not act on.

pub mod paypal;
pub mod stripe;

pub use paypal::parse_paypal_event;
pub use stripe::parse_stripe_event;

use novavid_shared::{PlanTier, Provider, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

/// A subscription lifecycle change, normalized across providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEvent {
    pub provider: Provider,
    pub external_event_id: String,
    /// Provider-side event timestamp; drives out-of-order rejection.
    pub event_timestamp: OffsetDateTime,
    pub external_customer_id: String,
    pub external_subscription_id: String,
    pub status: SubscriptionStatus,
    /// Tier this event entitles the account to, already folded with the
    /// status (a canceled subscription maps to Free whatever the plan).
    pub new_tier: PlanTier,
    pub period_end: Option<OffsetDateTime>,
    /// Account id carried in the payload itself, when the provider
    /// supports it. Used before any customer mapping exists.
    pub account_hint: Option<Uuid>,
}

/// A checkout completion, carrying the customer -> account mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerLinkEvent {
    pub provider: Provider,
    pub external_event_id: String,
    pub event_timestamp: OffsetDateTime,
    pub account_id: Uuid,
    pub external_customer_id: String,
    pub external_subscription_id: Option<String>,
}

/// A provider webhook reduced to what the reconciler acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    Subscription(SubscriptionEvent),
    CustomerLink(CustomerLinkEvent),
    /// Recognized envelope, event type we deliberately do not act on.
    Ignored { event_type: String },
}

/// Fold a subscription status and plan key into the entitled tier.
///
/// Only an active subscription entitles a paid tier. Pending, past-due,
/// canceled, and unpaid all map to Free; the account regains the tier
/// when the provider reports the subscription active again.
pub(crate) fn tier_for(status: SubscriptionStatus, plan_key: Option<&str>) -> PlanTier {
    if !status.is_entitled() {
        return PlanTier::Free;
    }
    plan_key.map(PlanTier::from_plan_key).unwrap_or(PlanTier::Free)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_for_folds_status_over_plan() {
        assert_eq!(
            tier_for(SubscriptionStatus::Active, Some("pro_monthly")),
            PlanTier::Pro
        );
        assert_eq!(
            tier_for(SubscriptionStatus::PastDue, Some("premium_yearly")),
            PlanTier::Free
        );
        assert_eq!(
            tier_for(SubscriptionStatus::PendingApproval, Some("pro_monthly")),
            PlanTier::Free
        );
        assert_eq!(
            tier_for(SubscriptionStatus::Canceled, Some("pro_monthly")),
            PlanTier::Free
        );
        assert_eq!(
            tier_for(SubscriptionStatus::Unpaid, Some("premium_monthly")),
            PlanTier::Free
        );
        assert_eq!(tier_for(SubscriptionStatus::Active, None), PlanTier::Free);
    }
}
