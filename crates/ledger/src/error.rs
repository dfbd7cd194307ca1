//! Ledger error types.
//!
//! The taxonomy distinguishes expected outcomes (`InsufficientCredits`),
//! retryable transients (`StorageConflict`), and non-retryable rejections
//! (`MalformedEvent`). Callers holding an idempotency key may retry the
//! whole operation on a transient error; everything else is final.

use uuid::Uuid;

/// Result type for all ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Not enough credits for the requested debit. An expected, user-facing
    /// outcome, never a system fault. Not retryable.
    #[error("insufficient credits: available={available}, requested={requested}")]
    InsufficientCredits { available: i64, requested: i64 },

    /// Account does not exist.
    #[error("account not found: {0}")]
    AccountNotFound(Uuid),

    /// An account with this id already exists.
    #[error("account already exists: {0}")]
    AccountExists(Uuid),

    /// Account is frozen pending manual reconciliation after an invariant
    /// violation was observed. All mutation refused.
    #[error("account {0} is frozen pending manual reconciliation")]
    AccountFrozen(Uuid),

    /// Account has been soft-closed.
    #[error("account {0} is closed")]
    AccountClosed(Uuid),

    /// No debit entry exists for this operation id on this account.
    #[error("unknown operation {operation_id} for account {account_id}")]
    UnknownOperation {
        account_id: Uuid,
        operation_id: String,
    },

    /// The debit under this operation id was already refunded (sweep
    /// timeout or explicit release). The caller must reserve under a new
    /// operation id. Not retryable.
    #[error("operation {operation_id} for account {account_id} was already refunded")]
    OperationExpired {
        account_id: Uuid,
        operation_id: String,
    },

    /// Debit or grant amount must be positive.
    #[error("invalid credit amount: {0}")]
    InvalidAmount(i64),

    /// Provider payload could not be normalized. Non-retryable; the caller
    /// should reject with a non-2xx status.
    #[error("malformed provider event: {0}")]
    MalformedEvent(String),

    /// Event could not be matched to an account yet. Retryable; the event
    /// is parked and reprocessed by the background worker.
    #[error("no account mapping for customer {0}")]
    UnresolvedAccountMapping(String),

    /// Transient storage contention (serialization failure, optimistic
    /// lock miss). Safe to retry with the same idempotency key.
    #[error("storage conflict: {0}")]
    StorageConflict(String),

    /// The metered work itself failed after a successful reservation. The
    /// reservation has already been released when this is returned.
    #[error("metered work failed: {0}")]
    WorkFailure(String),

    /// A ledger invariant does not hold. Fatal for the affected account:
    /// mutation is halted until manual reconciliation.
    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),

    #[error("database error: {0}")]
    Database(String),
}

impl LedgerError {
    /// Whether the caller may retry the whole operation with the same
    /// idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::StorageConflict(_) | LedgerError::UnresolvedAccountMapping(_)
        )
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            // 40001 = serialization_failure, 40P01 = deadlock_detected.
            // Both resolve on retry with the same idempotency key.
            if let Some(code) = db.code() {
                if code == "40001" || code == "40P01" {
                    return LedgerError::StorageConflict(db.to_string());
                }
            }
        }
        LedgerError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LedgerError::StorageConflict("lock".into()).is_retryable());
        assert!(LedgerError::UnresolvedAccountMapping("cus_1".into()).is_retryable());
        assert!(!LedgerError::InsufficientCredits {
            available: 5,
            requested: 10
        }
        .is_retryable());
        assert!(!LedgerError::MalformedEvent("bad json".into()).is_retryable());
    }
}
