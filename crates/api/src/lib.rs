// API server clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! NovaVid Entitlement API Server
//!
//! HTTP surface over the ledger: account registration and entitlement
//! lookup, the reserve / release / settle lifecycle for metered work,
//! and verified webhook intake for Stripe and PayPal.

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
