#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! NovaVid Shared Types
//!
//! Types used by every NovaVid crate: plan tiers and their capability
//! tables, payment provider identifiers, subscription status, and the
//! database pool helper.

pub mod db;
pub mod types;

pub use db::create_pool;
pub use types::{MusicLibrary, PlanLimits, PlanTier, Provider, SubscriptionStatus};
