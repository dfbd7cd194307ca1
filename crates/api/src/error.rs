//! API error responses.
//!
//! Maps ledger errors onto HTTP statuses with a stable JSON body:
//! `{"error": {"code": "...", "message": "..."}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use novavid_ledger::LedgerError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Webhook signature or shared secret did not verify.
    #[error("webhook signature invalid")]
    SignatureInvalid,

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::SignatureInvalid => (StatusCode::UNAUTHORIZED, "signature_invalid"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Ledger(e) => match e {
                LedgerError::InsufficientCredits { .. } => {
                    (StatusCode::PAYMENT_REQUIRED, "insufficient_credits")
                }
                LedgerError::AccountNotFound(_) | LedgerError::UnknownOperation { .. } => {
                    (StatusCode::NOT_FOUND, "not_found")
                }
                LedgerError::AccountExists(_) => (StatusCode::CONFLICT, "account_exists"),
                LedgerError::AccountFrozen(_) => (StatusCode::CONFLICT, "account_frozen"),
                LedgerError::OperationExpired { .. } => {
                    (StatusCode::CONFLICT, "operation_expired")
                }
                LedgerError::AccountClosed(_) => (StatusCode::GONE, "account_closed"),
                LedgerError::InvalidAmount(_) | LedgerError::MalformedEvent(_) => {
                    (StatusCode::BAD_REQUEST, "bad_request")
                }
                LedgerError::StorageConflict(_) | LedgerError::UnresolvedAccountMapping(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "retry_later")
                }
                LedgerError::WorkFailure(_) => (StatusCode::BAD_GATEWAY, "work_failed"),
                LedgerError::InvariantViolation(_) | LedgerError::Database(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // 5xx details stay in the log, not the response.
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(serde_json::json!({
            "error": { "code": code, "message": message }
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_error_status_mapping() {
        let err = ApiError::Ledger(LedgerError::InsufficientCredits {
            available: 1,
            requested: 2,
        });
        assert_eq!(err.status_and_code().0, StatusCode::PAYMENT_REQUIRED);

        let err = ApiError::Ledger(LedgerError::AccountNotFound(uuid::Uuid::new_v4()));
        assert_eq!(err.status_and_code().0, StatusCode::NOT_FOUND);

        let err = ApiError::Ledger(LedgerError::StorageConflict("lock".into()));
        assert_eq!(err.status_and_code().0, StatusCode::SERVICE_UNAVAILABLE);

        assert_eq!(
            ApiError::SignatureInvalid.status_and_code().0,
            StatusCode::UNAUTHORIZED
        );
    }
}
