//! PayPal webhook normalization.
//!
//! PayPal subscriptions carry the plan key directly in `plan_id` and our
//! account id in `custom_id`, so no price map is needed. Timestamps are
//! RFC 3339 strings rather than Unix seconds.

use novavid_shared::{Provider, SubscriptionStatus};
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

use super::{tier_for, NormalizedEvent, SubscriptionEvent};

/// PayPal webhook event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct PayPalEvent {
    /// Event ID (`WH-...`).
    pub id: String,
    /// Event type (e.g. "BILLING.SUBSCRIPTION.ACTIVATED").
    pub event_type: String,
    /// Event creation time, RFC 3339.
    pub create_time: String,
    /// The subscription resource the event is about.
    pub resource: serde_json::Value,
}

/// PayPal subscription resource, reduced to the acted-on fields.
#[derive(Debug, Clone, Deserialize)]
struct PayPalSubscription {
    /// Subscription ID (`I-...`).
    id: String,
    /// Plan key (e.g. "pro_monthly").
    #[serde(default)]
    plan_id: Option<String>,
    /// Our account id, set at subscription creation.
    #[serde(default)]
    custom_id: Option<String>,
    #[serde(default)]
    subscriber: Option<PayPalSubscriber>,
    #[serde(default)]
    billing_info: Option<PayPalBillingInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct PayPalSubscriber {
    #[serde(default)]
    payer_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PayPalBillingInfo {
    /// Next billing time, RFC 3339.
    #[serde(default)]
    next_billing_time: Option<String>,
}

fn rfc3339(value: &str, field: &str) -> LedgerResult<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|_| LedgerError::MalformedEvent(format!("invalid {field} timestamp: {value}")))
}

/// Normalize a raw PayPal webhook payload.
pub fn parse_paypal_event(payload: &str) -> LedgerResult<NormalizedEvent> {
    let event: PayPalEvent = serde_json::from_str(payload)
        .map_err(|e| LedgerError::MalformedEvent(format!("paypal envelope: {e}")))?;
    let event_timestamp = rfc3339(&event.create_time, "create_time")?;

    let status = match event.event_type.as_str() {
        "BILLING.SUBSCRIPTION.ACTIVATED" => SubscriptionStatus::Active,
        "BILLING.SUBSCRIPTION.CANCELLED"
        | "BILLING.SUBSCRIPTION.SUSPENDED"
        | "BILLING.SUBSCRIPTION.EXPIRED" => SubscriptionStatus::Canceled,
        "BILLING.SUBSCRIPTION.PAYMENT.FAILED" => SubscriptionStatus::PastDue,
        other => {
            return Ok(NormalizedEvent::Ignored {
                event_type: other.to_string(),
            })
        }
    };

    let sub: PayPalSubscription = serde_json::from_value(event.resource)
        .map_err(|e| LedgerError::MalformedEvent(format!("paypal subscription: {e}")))?;

    // custom_id is set by our checkout flow; tolerate anything else in it.
    let account_hint = sub
        .custom_id
        .as_deref()
        .and_then(|raw| Uuid::parse_str(raw).ok());

    let period_end = sub
        .billing_info
        .as_ref()
        .and_then(|b| b.next_billing_time.as_deref())
        .map(|raw| rfc3339(raw, "next_billing_time"))
        .transpose()?;

    let external_customer_id = sub
        .subscriber
        .and_then(|s| s.payer_id)
        .unwrap_or_default();

    Ok(NormalizedEvent::Subscription(SubscriptionEvent {
        provider: Provider::PayPal,
        external_event_id: event.id,
        event_timestamp,
        external_customer_id,
        external_subscription_id: sub.id,
        status,
        new_tier: tier_for(status, sub.plan_id.as_deref()),
        period_end,
        account_hint,
    }))
}
