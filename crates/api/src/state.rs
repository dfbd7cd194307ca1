//! Application state

use std::sync::Arc;

use novavid_ledger::store::LedgerStore;
use novavid_ledger::LedgerService;

use crate::config::ApiConfig;

/// Shared application state.
///
/// Generic over the ledger store so the router runs against Postgres in
/// production and the in-memory store in tests.
pub struct AppState<S> {
    pub ledger: Arc<LedgerService<S>>,
    pub config: Arc<ApiConfig>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: LedgerStore> AppState<S> {
    pub fn new(ledger: LedgerService<S>, config: ApiConfig) -> Self {
        Self {
            ledger: Arc::new(ledger),
            config: Arc::new(config),
        }
    }
}
