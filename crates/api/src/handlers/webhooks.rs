//! Webhook intake.
//!
//! Both endpoints take the raw body so the signature is computed over
//! exactly the bytes the provider signed. Verification failures are 401
//! and are never acknowledged; malformed payloads are 400 so the
//! provider retries or dead-letters on its side; everything else is
//! acknowledged so delivery stops.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use hmac::{Hmac, Mac};
use novavid_ledger::store::LedgerStore;
use novavid_ledger::IngestOutcome;
use novavid_shared::Provider;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance, in seconds.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a Stripe signature header against the raw payload.
///
/// The header carries `t=<timestamp>,v1=<signature>`; the signature is
/// HMAC-SHA256 of `"<timestamp>.<payload>"` under the endpoint secret.
pub fn verify_stripe_signature(
    payload: &str,
    signature_header: &str,
    webhook_secret: &str,
) -> Result<(), ApiError> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature_header.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => v1_signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(ApiError::SignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(ApiError::SignatureInvalid)?;

    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp,
            now,
            "Rejecting stripe webhook with stale signature timestamp"
        );
        return Err(ApiError::SignatureInvalid);
    }

    // The secret's "whsec_" prefix is not part of the key material.
    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{timestamp}.{payload}");

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| ApiError::SignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed.as_bytes().ct_eq(v1_signature.as_bytes()).into() {
        Ok(())
    } else {
        Err(ApiError::SignatureInvalid)
    }
}

fn outcome_response(outcome: IngestOutcome) -> (StatusCode, Json<serde_json::Value>) {
    let (status, body) = match outcome {
        IngestOutcome::Applied {
            account_id,
            from_tier,
            to_tier,
            bonus_granted,
        } => (
            StatusCode::OK,
            serde_json::json!({
                "outcome": "applied",
                "account_id": account_id,
                "from_tier": from_tier,
                "to_tier": to_tier,
                "bonus_granted": bonus_granted,
            }),
        ),
        IngestOutcome::Linked { account_id } => (
            StatusCode::OK,
            serde_json::json!({ "outcome": "linked", "account_id": account_id }),
        ),
        IngestOutcome::DuplicateIgnored => {
            (StatusCode::OK, serde_json::json!({ "outcome": "duplicate" }))
        }
        IngestOutcome::StaleIgnored => {
            (StatusCode::OK, serde_json::json!({ "outcome": "stale" }))
        }
        IngestOutcome::Parked => (
            StatusCode::ACCEPTED,
            serde_json::json!({ "outcome": "parked" }),
        ),
        IngestOutcome::Discarded { event_type } => (
            StatusCode::OK,
            serde_json::json!({ "outcome": "ignored", "event_type": event_type }),
        ),
    };
    (status, Json(body))
}

/// POST /v1/webhooks/stripe
pub async fn stripe<S: LedgerStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::SignatureInvalid)?;
    verify_stripe_signature(&body, signature, &state.config.stripe_webhook_secret)?;

    let outcome = state
        .ledger
        .reconciler
        .ingest(Provider::Stripe, &body)
        .await?;
    Ok(outcome_response(outcome))
}

/// POST /v1/webhooks/paypal
///
/// PayPal deliveries are forwarded by our edge with a shared secret in
/// the `x-webhook-secret` header.
pub async fn paypal<S: LedgerStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let presented = headers
        .get("x-webhook-secret")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::SignatureInvalid)?;
    let expected = state.config.paypal_webhook_secret.as_bytes();
    if !bool::from(presented.as_bytes().ct_eq(expected)) {
        return Err(ApiError::SignatureInvalid);
    }

    let outcome = state
        .ledger
        .reconciler
        .ingest(Provider::PayPal, &body)
        .await?;
    Ok(outcome_response(outcome))
}
