//! Stripe webhook normalization.
//!
//! Only the fields the reconciler acts on are deserialized; everything
//! else in the payload is ignored. Price ids are translated to plan keys
//! through the configured price map.

use std::collections::HashMap;
use std::str::FromStr;

use novavid_shared::{Provider, SubscriptionStatus};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

use super::{tier_for, CustomerLinkEvent, NormalizedEvent, SubscriptionEvent};

/// Stripe webhook event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    /// Event ID (`evt_...`).
    pub id: String,
    /// Event type (e.g. "customer.subscription.updated").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Created timestamp (Unix).
    pub created: i64,
    /// Event data.
    pub data: StripeEventData,
}

/// Event data container.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    /// The event object.
    pub object: serde_json::Value,
}

/// Stripe subscription object, reduced to the acted-on fields.
#[derive(Debug, Clone, Deserialize)]
struct StripeSubscription {
    /// Subscription ID (`sub_...`).
    id: String,
    /// Customer ID (`cus_...`).
    customer: String,
    /// Status (active, past_due, canceled, unpaid, ...).
    status: String,
    /// Current period end (Unix).
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    items: StripeSubscriptionItems,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StripeSubscriptionItems {
    #[serde(default)]
    data: Vec<StripeSubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct StripeSubscriptionItem {
    price: StripePrice,
}

#[derive(Debug, Clone, Deserialize)]
struct StripePrice {
    /// Price ID (`price_...`), translated via the configured price map.
    id: String,
}

/// Stripe Checkout session, reduced to the acted-on fields.
#[derive(Debug, Clone, Deserialize)]
struct StripeCheckoutSession {
    /// Customer ID.
    #[serde(default)]
    customer: Option<String>,
    /// Subscription ID when the session created one.
    #[serde(default)]
    subscription: Option<String>,
    /// Client reference ID (our account id).
    #[serde(default)]
    client_reference_id: Option<String>,
}

fn unix_timestamp(secs: i64, field: &str) -> LedgerResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|_| LedgerError::MalformedEvent(format!("invalid {field} timestamp: {secs}")))
}

/// Normalize a raw Stripe webhook payload.
///
/// `price_map` translates price ids to plan keys; a subscription whose
/// price is not in the map is malformed rather than silently Free.
pub fn parse_stripe_event(
    payload: &str,
    price_map: &HashMap<String, String>,
) -> LedgerResult<NormalizedEvent> {
    let event: StripeEvent = serde_json::from_str(payload)
        .map_err(|e| LedgerError::MalformedEvent(format!("stripe envelope: {e}")))?;
    let event_timestamp = unix_timestamp(event.created, "created")?;

    match event.event_type.as_str() {
        "customer.subscription.created"
        | "customer.subscription.updated"
        | "customer.subscription.deleted" => {
            let sub: StripeSubscription = serde_json::from_value(event.data.object)
                .map_err(|e| LedgerError::MalformedEvent(format!("stripe subscription: {e}")))?;

            // A deleted event means the subscription is gone whatever the
            // embedded status says.
            let status = if event.event_type == "customer.subscription.deleted" {
                SubscriptionStatus::Canceled
            } else {
                SubscriptionStatus::from_str(&sub.status).map_err(|e| {
                    LedgerError::MalformedEvent(format!("stripe subscription status: {e}"))
                })?
            };

            let plan_key = match sub.items.data.first() {
                Some(item) => Some(price_map.get(&item.price.id).cloned().ok_or_else(|| {
                    LedgerError::MalformedEvent(format!("unmapped stripe price: {}", item.price.id))
                })?),
                None => None,
            };

            let period_end = sub
                .current_period_end
                .map(|secs| unix_timestamp(secs, "current_period_end"))
                .transpose()?;

            Ok(NormalizedEvent::Subscription(SubscriptionEvent {
                provider: Provider::Stripe,
                external_event_id: event.id,
                event_timestamp,
                external_customer_id: sub.customer,
                external_subscription_id: sub.id,
                status,
                new_tier: tier_for(status, plan_key.as_deref()),
                period_end,
                account_hint: None,
            }))
        }
        "checkout.session.completed" => {
            let session: StripeCheckoutSession = serde_json::from_value(event.data.object)
                .map_err(|e| LedgerError::MalformedEvent(format!("stripe checkout: {e}")))?;

            let reference = session.client_reference_id.ok_or_else(|| {
                LedgerError::MalformedEvent("checkout session missing client_reference_id".into())
            })?;
            let account_id = Uuid::parse_str(&reference).map_err(|_| {
                LedgerError::MalformedEvent(format!(
                    "client_reference_id is not an account id: {reference}"
                ))
            })?;
            let customer = session.customer.ok_or_else(|| {
                LedgerError::MalformedEvent("checkout session missing customer".into())
            })?;

            Ok(NormalizedEvent::CustomerLink(CustomerLinkEvent {
                provider: Provider::Stripe,
                external_event_id: event.id,
                event_timestamp,
                account_id,
                external_customer_id: customer,
                external_subscription_id: session.subscription,
            }))
        }
        other => Ok(NormalizedEvent::Ignored {
            event_type: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use novavid_shared::PlanTier;

    fn price_map() -> HashMap<String, String> {
        [
            ("price_pro_m".to_string(), "pro_monthly".to_string()),
            ("price_prem_m".to_string(), "premium_monthly".to_string()),
        ]
        .into_iter()
        .collect()
    }

    fn subscription_payload(event_type: &str, status: &str, price_id: &str) -> String {
        serde_json::json!({
            "id": "evt_123",
            "type": event_type,
            "created": 1_700_000_000,
            "data": {
                "object": {
                    "id": "sub_123",
                    "customer": "cus_123",
                    "status": status,
                    "current_period_end": 1_702_592_000,
                    "items": {
                        "data": [{ "price": { "id": price_id } }]
                    }
                }
            }
        })
        .to_string()
    }

    #[test]
    fn test_active_subscription_maps_to_plan_tier() {
        let payload = subscription_payload("customer.subscription.updated", "active", "price_pro_m");
        let NormalizedEvent::Subscription(event) =
            parse_stripe_event(&payload, &price_map()).unwrap()
        else {
            panic!("expected subscription event");
        };

        assert_eq!(event.provider, Provider::Stripe);
        assert_eq!(event.external_event_id, "evt_123");
        assert_eq!(event.external_customer_id, "cus_123");
        assert_eq!(event.status, SubscriptionStatus::Active);
        assert_eq!(event.new_tier, PlanTier::Pro);
        assert!(event.period_end.is_some());
    }

    #[test]
    fn test_canceled_status_entitles_free() {
        let payload =
            subscription_payload("customer.subscription.updated", "canceled", "price_pro_m");
        let NormalizedEvent::Subscription(event) =
            parse_stripe_event(&payload, &price_map()).unwrap()
        else {
            panic!("expected subscription event");
        };
        assert_eq!(event.new_tier, PlanTier::Free);
    }

    #[test]
    fn test_deleted_event_forces_canceled() {
        let payload =
            subscription_payload("customer.subscription.deleted", "active", "price_prem_m");
        let NormalizedEvent::Subscription(event) =
            parse_stripe_event(&payload, &price_map()).unwrap()
        else {
            panic!("expected subscription event");
        };
        assert_eq!(event.status, SubscriptionStatus::Canceled);
        assert_eq!(event.new_tier, PlanTier::Free);
    }

    #[test]
    fn test_unmapped_price_is_malformed() {
        let payload =
            subscription_payload("customer.subscription.created", "active", "price_unknown");
        let err = parse_stripe_event(&payload, &price_map()).unwrap_err();
        assert!(matches!(err, LedgerError::MalformedEvent(_)));
    }

    #[test]
    fn test_checkout_session_yields_customer_link() {
        let account_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "id": "evt_456",
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "data": {
                "object": {
                    "customer": "cus_456",
                    "subscription": "sub_456",
                    "client_reference_id": account_id.to_string()
                }
            }
        })
        .to_string();

        let NormalizedEvent::CustomerLink(link) =
            parse_stripe_event(&payload, &price_map()).unwrap()
        else {
            panic!("expected customer link event");
        };
        assert_eq!(link.account_id, account_id);
        assert_eq!(link.external_customer_id, "cus_456");
        assert_eq!(link.external_subscription_id.as_deref(), Some("sub_456"));
    }

    #[test]
    fn test_unhandled_event_type_is_ignored() {
        let payload = serde_json::json!({
            "id": "evt_789",
            "type": "invoice.finalized",
            "created": 1_700_000_000,
            "data": { "object": {} }
        })
        .to_string();

        assert_eq!(
            parse_stripe_event(&payload, &price_map()).unwrap(),
            NormalizedEvent::Ignored {
                event_type: "invoice.finalized".to_string()
            }
        );
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let err = parse_stripe_event("not json", &price_map()).unwrap_err();
        assert!(matches!(err, LedgerError::MalformedEvent(_)));
    }
}
