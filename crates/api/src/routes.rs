//! Router assembly

use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use novavid_ledger::store::LedgerStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers::{accounts, admin, health, operations, webhooks};
use crate::state::AppState;

/// Build the full API router.
pub fn create_router<S: LedgerStore>(state: AppState<S>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health::health))
        // Accounts
        .route("/v1/accounts", post(accounts::register::<S>))
        .route("/v1/accounts/{id}", get(accounts::get_account::<S>))
        .route(
            "/v1/accounts/{id}/entitlement",
            get(accounts::entitlement::<S>),
        )
        .route("/v1/accounts/{id}/ledger", get(accounts::ledger_entries::<S>))
        .route("/v1/accounts/{id}/close", post(accounts::close_account::<S>))
        // Metered operations
        .route("/v1/operations/reserve", post(operations::reserve::<S>))
        .route(
            "/v1/operations/{operation_id}/release",
            post(operations::release::<S>),
        )
        .route(
            "/v1/operations/{operation_id}/settle",
            post(operations::settle::<S>),
        )
        // Webhooks
        .route("/v1/webhooks/stripe", post(webhooks::stripe::<S>))
        .route("/v1/webhooks/paypal", post(webhooks::paypal::<S>))
        // Operational surface (internal ingress only)
        .route("/v1/admin/invariants", get(admin::run_invariants::<S>))
        .route(
            "/v1/admin/invariants/enforce",
            post(admin::enforce_invariants::<S>),
        )
        .route("/v1/admin/sweep", post(admin::sweep::<S>))
        .route("/v1/admin/parked/retry", post(admin::retry_parked::<S>))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use hmac::{Hmac, Mac};
    use http_body_util::BodyExt;
    use novavid_ledger::{LedgerConfig, LedgerService, MemoryLedgerStore};
    use sha2::Sha256;
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const STRIPE_SECRET: &str = "whsec_testsecret";
    const PAYPAL_SECRET: &str = "paypal_shared_secret";

    fn test_router() -> Router {
        let mut ledger_config = LedgerConfig::default();
        ledger_config
            .stripe_price_map
            .insert("price_pro_m".to_string(), "pro_monthly".to_string());
        let ledger = LedgerService::new(Arc::new(MemoryLedgerStore::new()), ledger_config);
        let config = ApiConfig {
            database_url: String::new(),
            port: 0,
            stripe_webhook_secret: STRIPE_SECRET.to_string(),
            paypal_webhook_secret: PAYPAL_SECRET.to_string(),
        };
        create_router(AppState::new(ledger, config))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn stripe_signature(payload: &str) -> String {
        let timestamp = time::OffsetDateTime::now_utc().unix_timestamp();
        let key = STRIPE_SECRET.strip_prefix("whsec_").unwrap();
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    async fn register_account(router: &Router) -> Uuid {
        let response = router
            .clone()
            .oneshot(json_request("POST", "/v1/accounts", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        body["id"].as_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = test_router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_register_and_entitlement() {
        let router = test_router();
        let id = register_account(&router).await;

        let response = router
            .oneshot(
                Request::get(format!("/v1/accounts/{id}/entitlement"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;

        // Fresh accounts are in the Pro trial with the signup grant.
        assert_eq!(body["effective_tier"], "pro");
        assert_eq!(body["base_tier"], "free");
        assert_eq!(body["trial_active"], true);
        assert_eq!(body["credits"], 100);
        assert_eq!(body["limits"]["max_video_duration_secs"], 18);
    }

    #[tokio::test]
    async fn test_unknown_account_is_404() {
        let response = test_router()
            .oneshot(
                Request::get(format!("/v1/accounts/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reserve_then_release_roundtrip() {
        let router = test_router();
        let id = register_account(&router).await;

        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/operations/reserve",
                serde_json::json!({
                    "account_id": id,
                    "amount": 40,
                    "operation_id": "op-1"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["balance"], 60);
        assert_eq!(body["replayed"], false);

        let response = router
            .oneshot(json_request(
                "POST",
                "/v1/operations/op-1/release",
                serde_json::json!({ "account_id": id }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["outcome"], "refunded");
        assert_eq!(body["balance"], 100);
    }

    #[tokio::test]
    async fn test_insufficient_credits_is_402() {
        let router = test_router();
        let id = register_account(&router).await;

        let response = router
            .oneshot(json_request(
                "POST",
                "/v1/operations/reserve",
                serde_json::json!({
                    "account_id": id,
                    "amount": 1_000,
                    "operation_id": "op-big"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "insufficient_credits");
    }

    #[tokio::test]
    async fn test_stripe_webhook_requires_signature() {
        let payload = serde_json::json!({
            "id": "evt_1",
            "type": "invoice.finalized",
            "created": time::OffsetDateTime::now_utc().unix_timestamp(),
            "data": { "object": {} }
        })
        .to_string();

        // Unsigned delivery is rejected.
        let response = test_router()
            .oneshot(
                Request::post("/v1/webhooks/stripe")
                    .body(Body::from(payload.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Signed delivery is acknowledged.
        let response = test_router()
            .oneshot(
                Request::post("/v1/webhooks/stripe")
                    .header("stripe-signature", stripe_signature(&payload))
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["outcome"], "ignored");
    }

    #[tokio::test]
    async fn test_stripe_lifecycle_before_checkout_is_202() {
        let router = test_router();
        register_account(&router).await;

        let payload = serde_json::json!({
            "id": "evt_race",
            "type": "customer.subscription.updated",
            "created": time::OffsetDateTime::now_utc().unix_timestamp(),
            "data": { "object": {
                "id": "sub_1",
                "customer": "cus_unmapped",
                "status": "active",
                "items": { "data": [{ "price": { "id": "price_pro_m" } }] }
            }}
        })
        .to_string();

        let response = router
            .oneshot(
                Request::post("/v1/webhooks/stripe")
                    .header("stripe-signature", stripe_signature(&payload))
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["outcome"], "parked");
    }

    #[tokio::test]
    async fn test_paypal_webhook_shared_secret() {
        let router = test_router();
        let id = register_account(&router).await;

        let payload = serde_json::json!({
            "id": "WH-1",
            "event_type": "BILLING.SUBSCRIPTION.ACTIVATED",
            "create_time": "2026-02-10T12:00:00Z",
            "resource": {
                "id": "I-1",
                "plan_id": "pro_monthly",
                "custom_id": id.to_string()
            }
        })
        .to_string();

        // Wrong secret.
        let response = router
            .clone()
            .oneshot(
                Request::post("/v1/webhooks/paypal")
                    .header("x-webhook-secret", "wrong")
                    .body(Body::from(payload.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Correct secret applies the change.
        let response = router
            .oneshot(
                Request::post("/v1/webhooks/paypal")
                    .header("x-webhook-secret", PAYPAL_SECRET)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["outcome"], "applied");
        assert_eq!(body["to_tier"], "pro");
    }

    #[tokio::test]
    async fn test_malformed_webhook_is_400() {
        let payload = "not json".to_string();
        let response = test_router()
            .oneshot(
                Request::post("/v1/webhooks/stripe")
                    .header("stripe-signature", stripe_signature(&payload))
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admin_invariants_healthy() {
        let router = test_router();
        register_account(&router).await;

        let response = router
            .oneshot(
                Request::get("/v1/admin/invariants")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["healthy"], true);
    }
}
