//! Stale reservation sweep.
//!
//! Reservations whose caller died before settling or releasing would
//! leak credits forever. The sweep refunds any debit still unresolved
//! after the configured TTL. Settled debits are never touched, and the
//! refund path is the same idempotent one callers use, so racing a late
//! release is harmless.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::config::LedgerConfig;
use crate::engine::LedgerEngine;
use crate::error::{LedgerError, LedgerResult};
use crate::store::{LedgerStore, RefundOutcome};

/// Counters from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub refunded: usize,
    pub skipped: usize,
}

/// Refunds reservations that outlived their TTL.
pub struct ReservationSweeper<S> {
    store: Arc<S>,
    engine: LedgerEngine<S>,
    config: Arc<LedgerConfig>,
}

impl<S> Clone for ReservationSweeper<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            engine: self.engine.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: LedgerStore> ReservationSweeper<S> {
    pub fn new(store: Arc<S>, config: Arc<LedgerConfig>) -> Self {
        Self {
            engine: LedgerEngine::new(Arc::clone(&store)),
            store,
            config,
        }
    }

    /// Refund every debit still unresolved past the reservation TTL.
    pub async fn refund_stale(&self) -> LedgerResult<SweepReport> {
        let cutoff = OffsetDateTime::now_utc() - self.config.reservation_ttl;
        let mut report = SweepReport::default();

        for debit in self.store.unresolved_debits_before(cutoff).await? {
            report.examined += 1;
            let Some(operation_id) = debit.operation_id.as_deref() else {
                report.skipped += 1;
                continue;
            };

            match self.engine.release(debit.account_id, operation_id).await {
                Ok(RefundOutcome::Refunded { amount, balance }) => {
                    report.refunded += 1;
                    tracing::info!(
                        account_id = %debit.account_id,
                        operation_id = %operation_id,
                        amount,
                        balance,
                        "Stale reservation refunded"
                    );
                }
                // Lost the race with a late settle or release; fine.
                Ok(_) => report.skipped += 1,
                Err(LedgerError::AccountFrozen(id)) => {
                    report.skipped += 1;
                    tracing::warn!(
                        account_id = %id,
                        operation_id = %operation_id,
                        "Skipping stale reservation on frozen account"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                refunded = report.refunded,
                skipped = report.skipped,
                "Reservation sweep complete"
            );
        }
        Ok(report)
    }
}
