//! Webhook reconciliation.
//!
//! Takes verified provider payloads, normalizes them, resolves the
//! target account, and applies the change through the store's atomic
//! operations. Delivery is at-least-once and unordered on the provider
//! side; everything here is written so replays and reordering converge
//! on the same final state.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use novavid_shared::{PlanTier, Provider};

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::providers::{
    parse_paypal_event, parse_stripe_event, CustomerLinkEvent, NormalizedEvent, SubscriptionEvent,
};
use crate::store::{
    CustomerLink, LedgerStore, LinkOutcome, ParkedEvent, PlanChange, PlanChangeOutcome,
};

/// How many retries a parked event gets before it is dropped.
const MAX_PARKED_ATTEMPTS: i32 = 10;

/// What ingesting one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The subscription change was applied to the account.
    Applied {
        account_id: Uuid,
        from_tier: PlanTier,
        to_tier: PlanTier,
        bonus_granted: i64,
    },
    /// The customer -> account mapping was installed.
    Linked { account_id: Uuid },
    /// The event id was already processed; nothing changed.
    DuplicateIgnored,
    /// The event is older than the state already applied; recorded as
    /// processed, nothing else changed.
    StaleIgnored,
    /// No account could be resolved yet; the event waits for the
    /// background retry.
    Parked,
    /// Recognized but deliberately not acted on.
    Discarded { event_type: String },
}

/// Counters from one parked-event retry pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub retried: usize,
    pub applied: usize,
    pub still_parked: usize,
    pub dropped: usize,
}

/// Applies normalized provider events to the ledger.
pub struct Reconciler<S> {
    store: Arc<S>,
    config: Arc<LedgerConfig>,
}

impl<S> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: LedgerStore> Reconciler<S> {
    pub fn new(store: Arc<S>, config: Arc<LedgerConfig>) -> Self {
        Self { store, config }
    }

    /// Ingest one verified webhook payload.
    ///
    /// Malformed payloads fail with [`LedgerError::MalformedEvent`] and
    /// must be rejected back to the provider; every other path returns an
    /// outcome the caller can acknowledge.
    pub async fn ingest(&self, provider: Provider, payload: &str) -> LedgerResult<IngestOutcome> {
        let event = match provider {
            Provider::Stripe => parse_stripe_event(payload, &self.config.stripe_price_map)?,
            Provider::PayPal => parse_paypal_event(payload)?,
        };
        self.apply(event, payload).await
    }

    async fn apply(
        &self,
        event: NormalizedEvent,
        raw_payload: &str,
    ) -> LedgerResult<IngestOutcome> {
        match event {
            NormalizedEvent::Subscription(event) => self.apply_subscription(event, raw_payload).await,
            NormalizedEvent::CustomerLink(event) => self.apply_link(event).await,
            NormalizedEvent::Ignored { event_type } => {
                tracing::debug!(event_type = %event_type, "Discarding unhandled provider event");
                Ok(IngestOutcome::Discarded { event_type })
            }
        }
    }

    async fn apply_subscription(
        &self,
        event: SubscriptionEvent,
        raw_payload: &str,
    ) -> LedgerResult<IngestOutcome> {
        // Cheap pre-check; the store claim below is what actually
        // guarantees exactly-once application.
        if self
            .store
            .is_event_processed(event.provider, &event.external_event_id)
            .await?
        {
            tracing::debug!(
                provider = %event.provider,
                event_id = %event.external_event_id,
                "Duplicate delivery absorbed"
            );
            return Ok(IngestOutcome::DuplicateIgnored);
        }

        let Some(account_id) = self.resolve_account(&event).await? else {
            self.park(&event, raw_payload).await?;
            return Ok(IngestOutcome::Parked);
        };

        let change = PlanChange {
            provider: event.provider,
            external_event_id: event.external_event_id.clone(),
            event_timestamp: event.event_timestamp,
            account_id,
            external_customer_id: event.external_customer_id,
            external_subscription_id: event.external_subscription_id,
            status: event.status,
            new_tier: event.new_tier,
            period_end: event.period_end,
            upgrade_bonus: self.config.upgrade_bonus(event.new_tier),
        };

        match self.store.apply_plan_change(&change).await? {
            PlanChangeOutcome::Applied {
                from_tier,
                to_tier,
                bonus_granted,
            } => {
                tracing::info!(
                    account_id = %account_id,
                    provider = %change.provider,
                    event_id = %change.external_event_id,
                    from_tier = %from_tier,
                    to_tier = %to_tier,
                    bonus_granted,
                    "Subscription change applied"
                );
                Ok(IngestOutcome::Applied {
                    account_id,
                    from_tier,
                    to_tier,
                    bonus_granted,
                })
            }
            PlanChangeOutcome::DuplicateIgnored => Ok(IngestOutcome::DuplicateIgnored),
            PlanChangeOutcome::StaleIgnored => {
                tracing::info!(
                    account_id = %account_id,
                    event_id = %change.external_event_id,
                    "Stale out-of-order event absorbed"
                );
                Ok(IngestOutcome::StaleIgnored)
            }
        }
    }

    async fn apply_link(&self, event: CustomerLinkEvent) -> LedgerResult<IngestOutcome> {
        // The mapping target must exist; a checkout for an unknown
        // account id is a provider-side misconfiguration.
        if self.store.get_account(event.account_id).await?.is_none() {
            return Err(LedgerError::MalformedEvent(format!(
                "checkout references unknown account {}",
                event.account_id
            )));
        }

        let link = CustomerLink {
            provider: event.provider,
            external_event_id: event.external_event_id,
            event_timestamp: event.event_timestamp,
            account_id: event.account_id,
            external_customer_id: event.external_customer_id,
            external_subscription_id: event.external_subscription_id,
        };

        match self.store.link_customer(&link).await? {
            LinkOutcome::Linked => {
                tracing::info!(
                    account_id = %link.account_id,
                    provider = %link.provider,
                    customer_id = %link.external_customer_id,
                    "Customer mapping installed"
                );
                Ok(IngestOutcome::Linked {
                    account_id: link.account_id,
                })
            }
            LinkOutcome::DuplicateIgnored => Ok(IngestOutcome::DuplicateIgnored),
        }
    }

    /// Resolve which account a subscription event belongs to: customer
    /// mapping first, then subscription id, then the payload's own
    /// account hint.
    async fn resolve_account(&self, event: &SubscriptionEvent) -> LedgerResult<Option<Uuid>> {
        if !event.external_customer_id.is_empty() {
            if let Some(id) = self
                .store
                .find_by_customer(event.provider, &event.external_customer_id)
                .await?
            {
                return Ok(Some(id));
            }
        }
        if let Some(id) = self
            .store
            .find_by_subscription(event.provider, &event.external_subscription_id)
            .await?
        {
            return Ok(Some(id));
        }
        if let Some(hint) = event.account_hint {
            if self.store.get_account(hint).await?.is_some() {
                return Ok(Some(hint));
            }
        }
        Ok(None)
    }

    async fn park(&self, event: &SubscriptionEvent, raw_payload: &str) -> LedgerResult<()> {
        let payload: serde_json::Value = serde_json::from_str(raw_payload)
            .map_err(|e| LedgerError::MalformedEvent(format!("unparseable parked payload: {e}")))?;
        self.store
            .park_event(&ParkedEvent {
                id: Uuid::new_v4(),
                provider: event.provider,
                external_event_id: event.external_event_id.clone(),
                payload,
                attempts: 0,
                parked_at: OffsetDateTime::now_utc(),
            })
            .await?;
        tracing::warn!(
            provider = %event.provider,
            event_id = %event.external_event_id,
            customer_id = %event.external_customer_id,
            "Event parked, no account mapping yet"
        );
        Ok(())
    }

    /// Retry up to `limit` parked events. Events that apply are removed;
    /// events still missing their mapping stay parked with a bumped
    /// attempt count; events over the attempt limit are dropped.
    pub async fn retry_parked(&self, limit: usize) -> LedgerResult<RetryReport> {
        let mut report = RetryReport::default();
        let now = OffsetDateTime::now_utc();

        for parked in self.store.list_parked(limit).await? {
            report.retried += 1;
            let payload = parked.payload.to_string();

            match self.ingest(parked.provider, &payload).await {
                Ok(IngestOutcome::Parked) => {
                    if parked.attempts + 1 >= MAX_PARKED_ATTEMPTS {
                        self.store.delete_parked(parked.id).await?;
                        report.dropped += 1;
                        tracing::error!(
                            provider = %parked.provider,
                            event_id = %parked.external_event_id,
                            attempts = parked.attempts + 1,
                            "Dropping parked event, mapping never appeared"
                        );
                    } else {
                        self.store.bump_parked_attempts(parked.id, now).await?;
                        report.still_parked += 1;
                    }
                }
                Ok(outcome) => {
                    self.store.delete_parked(parked.id).await?;
                    report.applied += 1;
                    tracing::info!(
                        provider = %parked.provider,
                        event_id = %parked.external_event_id,
                        ?outcome,
                        "Parked event resolved"
                    );
                }
                Err(e) if e.is_retryable() => {
                    self.store.bump_parked_attempts(parked.id, now).await?;
                    report.still_parked += 1;
                }
                Err(e) => {
                    // A payload that no longer parses will never succeed.
                    self.store.delete_parked(parked.id).await?;
                    report.dropped += 1;
                    tracing::error!(
                        provider = %parked.provider,
                        event_id = %parked.external_event_id,
                        error = %e,
                        "Dropping parked event"
                    );
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::store::MemoryLedgerStore;
    use novavid_shared::SubscriptionStatus;

    fn harness() -> (Reconciler<MemoryLedgerStore>, Arc<MemoryLedgerStore>) {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut config = LedgerConfig::default();
        config
            .stripe_price_map
            .insert("price_pro_m".to_string(), "pro_monthly".to_string());
        config
            .stripe_price_map
            .insert("price_prem_m".to_string(), "premium_monthly".to_string());
        (Reconciler::new(Arc::clone(&store), Arc::new(config)), store)
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

    fn stripe_checkout(account_id: Uuid, event_id: &str, created: i64) -> String {
        serde_json::json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "created": created,
            "data": { "object": {
                "customer": "cus_1",
                "subscription": "sub_1",
                "client_reference_id": account_id.to_string()
            }}
        })
        .to_string()
    }

    fn stripe_subscription(event_id: &str, created: i64, status: &str, price: &str) -> String {
        serde_json::json!({
            "id": event_id,
            "type": "customer.subscription.updated",
            "created": created,
            "data": { "object": {
                "id": "sub_1",
                "customer": "cus_1",
                "status": status,
                "current_period_end": created + 2_592_000,
                "items": { "data": [{ "price": { "id": price } }] }
            }}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_replayed_event_applies_once() {
        let (reconciler, store) = harness();
        let account_id = register(&store).await;
        reconciler
            .ingest(Provider::Stripe, &stripe_checkout(account_id, "evt_link", 1_000))
            .await
            .unwrap();

        let payload = stripe_subscription("evt_up", 2_000, "active", "price_pro_m");
        let first = reconciler.ingest(Provider::Stripe, &payload).await.unwrap();
        assert!(matches!(
            first,
            IngestOutcome::Applied {
                to_tier: PlanTier::Pro,
                bonus_granted: 500,
                ..
            }
        ));

        let replay = reconciler.ingest(Provider::Stripe, &payload).await.unwrap();
        assert_eq!(replay, IngestOutcome::DuplicateIgnored);

        // The bonus was granted exactly once.
        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.credits, 100 + 500);
        assert_eq!(account.plan_tier, PlanTier::Pro);
    }

    #[tokio::test]
    async fn test_out_of_order_delivery_keeps_newest_state() {
        let (reconciler, store) = harness();
        let account_id = register(&store).await;
        reconciler
            .ingest(Provider::Stripe, &stripe_checkout(account_id, "evt_link", 1_000))
            .await
            .unwrap();

        // The cancellation (T2) arrives before the activation (T1).
        let cancel = stripe_subscription("evt_t2", 5_000, "canceled", "price_pro_m");
        let activate = stripe_subscription("evt_t1", 3_000, "active", "price_pro_m");

        assert!(matches!(
            reconciler.ingest(Provider::Stripe, &cancel).await.unwrap(),
            IngestOutcome::Applied {
                to_tier: PlanTier::Free,
                ..
            }
        ));
        assert_eq!(
            reconciler.ingest(Provider::Stripe, &activate).await.unwrap(),
            IngestOutcome::StaleIgnored
        );

        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.plan_tier, PlanTier::Free);
        // The stale event is still recorded, so its redelivery is a duplicate.
        assert_eq!(
            reconciler.ingest(Provider::Stripe, &activate).await.unwrap(),
            IngestOutcome::DuplicateIgnored
        );
    }

    #[tokio::test]
    async fn test_lifecycle_before_checkout_parks_then_resolves() {
        let (reconciler, store) = harness();
        let account_id = register(&store).await;

        // Lifecycle event races ahead of the checkout completion.
        let lifecycle = stripe_subscription("evt_up", 2_000, "active", "price_pro_m");
        assert_eq!(
            reconciler.ingest(Provider::Stripe, &lifecycle).await.unwrap(),
            IngestOutcome::Parked
        );

        // Checkout arrives, installing the mapping.
        reconciler
            .ingest(Provider::Stripe, &stripe_checkout(account_id, "evt_link", 1_000))
            .await
            .unwrap();

        let report = reconciler.retry_parked(10).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.applied, 1);

        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.plan_tier, PlanTier::Pro);
        assert!(store.list_parked(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_past_due_drops_paid_tier() {
        let (reconciler, store) = harness();
        let account_id = register(&store).await;
        reconciler
            .ingest(Provider::Stripe, &stripe_checkout(account_id, "evt_link", 1_000))
            .await
            .unwrap();
        reconciler
            .ingest(
                Provider::Stripe,
                &stripe_subscription("evt_up", 2_000, "active", "price_pro_m"),
            )
            .await
            .unwrap();

        let outcome = reconciler
            .ingest(
                Provider::Stripe,
                &stripe_subscription("evt_due", 3_000, "past_due", "price_pro_m"),
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Applied {
                to_tier: PlanTier::Free,
                ..
            }
        ));

        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.plan_tier, PlanTier::Free);
        assert_eq!(
            account.subscription.unwrap().status,
            SubscriptionStatus::PastDue
        );
    }

    #[tokio::test]
    async fn test_activation_older_than_checkout_still_applies() {
        let (reconciler, store) = harness();
        let account_id = register(&store).await;

        // Stripe emits the checkout and subscription events of one purchase
        // with no ordering guarantee on their created timestamps.
        reconciler
            .ingest(Provider::Stripe, &stripe_checkout(account_id, "evt_link", 3_000))
            .await
            .unwrap();

        let outcome = reconciler
            .ingest(
                Provider::Stripe,
                &stripe_subscription("evt_up", 2_000, "active", "price_pro_m"),
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Applied {
                to_tier: PlanTier::Pro,
                ..
            }
        ));
        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.plan_tier, PlanTier::Pro);
    }

    #[tokio::test]
    async fn test_paypal_custom_id_resolves_without_mapping() {
        let (reconciler, store) = harness();
        let account_id = register(&store).await;

        let payload = serde_json::json!({
            "id": "WH-1",
            "event_type": "BILLING.SUBSCRIPTION.ACTIVATED",
            "create_time": "2026-02-10T12:00:00Z",
            "resource": {
                "id": "I-1",
                "plan_id": "premium_monthly",
                "custom_id": account_id.to_string(),
                "subscriber": { "payer_id": "PAYER1" }
            }
        })
        .to_string();

        assert!(matches!(
            reconciler.ingest(Provider::PayPal, &payload).await.unwrap(),
            IngestOutcome::Applied {
                to_tier: PlanTier::Premium,
                ..
            }
        ));

        let account = store.get_account(account_id).await.unwrap().unwrap();
        let sub = account.subscription.unwrap();
        assert_eq!(sub.provider, Provider::PayPal);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.external_subscription_id, "I-1");
    }

    #[tokio::test]
    async fn test_cancellation_leaves_credits_untouched() {
        let (reconciler, store) = harness();
        let account_id = register(&store).await;
        reconciler
            .ingest(Provider::Stripe, &stripe_checkout(account_id, "evt_link", 1_000))
            .await
            .unwrap();
        reconciler
            .ingest(
                Provider::Stripe,
                &stripe_subscription("evt_up", 2_000, "active", "price_pro_m"),
            )
            .await
            .unwrap();
        let before = store.get_account(account_id).await.unwrap().unwrap().credits;

        reconciler
            .ingest(
                Provider::Stripe,
                &stripe_subscription("evt_cancel", 3_000, "canceled", "price_pro_m"),
            )
            .await
            .unwrap();

        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.plan_tier, PlanTier::Free);
        assert_eq!(account.credits, before);
    }

    #[tokio::test]
    async fn test_downgrade_grants_no_bonus() {
        let (reconciler, store) = harness();
        let account_id = register(&store).await;
        reconciler
            .ingest(Provider::Stripe, &stripe_checkout(account_id, "evt_link", 1_000))
            .await
            .unwrap();
        reconciler
            .ingest(
                Provider::Stripe,
                &stripe_subscription("evt_pro", 2_000, "active", "price_pro_m"),
            )
            .await
            .unwrap();

        let outcome = reconciler
            .ingest(
                Provider::Stripe,
                &stripe_subscription("evt_prem", 3_000, "active", "price_prem_m"),
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Applied {
                from_tier: PlanTier::Pro,
                to_tier: PlanTier::Premium,
                bonus_granted: 0,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_rejected() {
        let (reconciler, _) = harness();
        assert!(matches!(
            reconciler.ingest(Provider::Stripe, "{}").await.unwrap_err(),
            LedgerError::MalformedEvent(_)
        ));
    }
}
