// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! NovaVid Ledger Module
//!
//! Entitlements and credit accounting for the editor backend.
//!
//! ## Features
//!
//! - **Credit Ledger**: Append-only entries, idempotent reserve / release /
//!   settle keyed by operation id
//! - **Plan Resolution**: Effective tier from stored tier plus the signup
//!   trial window
//! - **Webhook Reconciliation**: Stripe and PayPal events normalized,
//!   deduplicated, and applied newest-wins
//! - **Metered Gateway**: Run credit-costed work with exactly-once charging
//! - **Sweep**: Auto-refund reservations that outlive their TTL
//! - **Invariants**: Runnable consistency checks, freezing on critical
//!   violations

pub mod account;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod providers;
pub mod reconciler;
pub mod resolver;
pub mod store;
pub mod sweep;


// Account
pub use account::{Account, AccountService, SubscriptionRef};

// Config
pub use config::LedgerConfig;

// Engine
pub use engine::{LedgerEngine, Reservation};

// Error
pub use error::{LedgerError, LedgerResult};

// Gateway
pub use gateway::MeteredGateway;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Providers
pub use providers::{
    parse_paypal_event, parse_stripe_event, CustomerLinkEvent, NormalizedEvent, SubscriptionEvent,
};

// Reconciler
pub use reconciler::{IngestOutcome, Reconciler, RetryReport};

// Resolver
pub use resolver::{effective_tier, resolve, Entitlement};

// Store
pub use store::{
    CreditReason, DebitResolution, LedgerEntry, LedgerStore, MemoryLedgerStore, PgLedgerStore,
    RefundOutcome, SettleOutcome,
};

// Sweep
pub use sweep::{ReservationSweeper, SweepReport};

use std::sync::Arc;

use sqlx::PgPool;

/// Main ledger service that combines all ledger functionality
pub struct LedgerService<S> {
    pub accounts: AccountService<S>,
    pub engine: LedgerEngine<S>,
    pub gateway: MeteredGateway<S>,
    pub reconciler: Reconciler<S>,
    pub sweeper: ReservationSweeper<S>,
    pub invariants: InvariantChecker<S>,
    pub config: Arc<LedgerConfig>,
    pub store: Arc<S>,
}

impl<S> Clone for LedgerService<S> {
    fn clone(&self) -> Self {
        Self {
            accounts: self.accounts.clone(),
            engine: self.engine.clone(),
            gateway: self.gateway.clone(),
            reconciler: self.reconciler.clone(),
            sweeper: self.sweeper.clone(),
            invariants: self.invariants.clone(),
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LedgerStore> LedgerService<S> {
    /// Create a ledger service over any store with explicit config.
    pub fn new(store: Arc<S>, config: LedgerConfig) -> Self {
        let config = Arc::new(config);
        Self {
            accounts: AccountService::new(Arc::clone(&store), Arc::clone(&config)),
            engine: LedgerEngine::new(Arc::clone(&store)),
            gateway: MeteredGateway::new(Arc::clone(&store), Arc::clone(&config)),
            reconciler: Reconciler::new(Arc::clone(&store), Arc::clone(&config)),
            sweeper: ReservationSweeper::new(Arc::clone(&store), Arc::clone(&config)),
            invariants: InvariantChecker::new(Arc::clone(&store), Arc::clone(&config)),
            config,
            store,
        }
    }
}

impl LedgerService<PgLedgerStore> {
    /// Create a Postgres-backed ledger service from environment variables.
    pub fn from_env(pool: PgPool) -> Self {
        Self::new(
            Arc::new(PgLedgerStore::new(pool)),
            LedgerConfig::from_env(),
        )
    }
}
