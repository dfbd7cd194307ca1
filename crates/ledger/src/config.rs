//! Ledger policy configuration.
//!
//! Every policy value the product team may want to tune lives here and is
//! overridable from the environment. Notably the Pro auto-recharge: the
//! product copy calls Pro "unlimited" while the credit path tops Pro users
//! back up when they run low. Until that is settled the recharge is a
//! config switch, not a hard-coded rule.

use std::collections::HashMap;
use std::time::Duration;

use novavid_shared::PlanTier;

/// Policy values for the ledger, reconciler, and gateway.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Credits granted at registration.
    pub signup_credits: i64,
    /// Trial length in days; while active the effective tier is Pro.
    pub trial_days: i64,
    /// One-time bonus credits granted on upgrade to Premium.
    pub upgrade_bonus_premium: i64,
    /// One-time bonus credits granted on upgrade to Pro.
    pub upgrade_bonus_pro: i64,
    /// Whether Pro accounts are topped up when below a debit cost.
    pub pro_recharge_enabled: bool,
    /// Amount granted by a Pro auto-recharge.
    pub pro_recharge_amount: i64,
    /// How long a reservation may stay unresolved before the sweep
    /// refunds it.
    pub reservation_ttl: Duration,
    /// Stripe price id -> plan key (e.g. `price_123` -> `pro_monthly`).
    pub stripe_price_map: HashMap<String, String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            signup_credits: 100,
            trial_days: 5,
            upgrade_bonus_premium: 200,
            upgrade_bonus_pro: 500,
            pro_recharge_enabled: true,
            pro_recharge_amount: 100,
            reservation_ttl: Duration::from_secs(3600),
            stripe_price_map: HashMap::new(),
        }
    }
}

impl LedgerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            signup_credits: env_i64("NOVAVID_SIGNUP_CREDITS", defaults.signup_credits),
            trial_days: env_i64("NOVAVID_TRIAL_DAYS", defaults.trial_days),
            upgrade_bonus_premium: env_i64(
                "NOVAVID_UPGRADE_BONUS_PREMIUM",
                defaults.upgrade_bonus_premium,
            ),
            upgrade_bonus_pro: env_i64("NOVAVID_UPGRADE_BONUS_PRO", defaults.upgrade_bonus_pro),
            pro_recharge_enabled: env_bool(
                "NOVAVID_PRO_RECHARGE_ENABLED",
                defaults.pro_recharge_enabled,
            ),
            pro_recharge_amount: env_i64(
                "NOVAVID_PRO_RECHARGE_AMOUNT",
                defaults.pro_recharge_amount,
            ),
            reservation_ttl: Duration::from_secs(env_i64(
                "NOVAVID_RESERVATION_TTL_SECS",
                defaults.reservation_ttl.as_secs() as i64,
            )
            .max(0) as u64),
            stripe_price_map: parse_price_map(
                &std::env::var("NOVAVID_STRIPE_PRICE_MAP").unwrap_or_default(),
            ),
        }
    }

    /// Bonus credits granted when an account is upgraded to `tier`.
    pub fn upgrade_bonus(&self, tier: PlanTier) -> i64 {
        match tier {
            PlanTier::Free => 0,
            PlanTier::Premium => self.upgrade_bonus_premium,
            PlanTier::Pro => self.upgrade_bonus_pro,
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse `price_a=pro_monthly,price_b=premium_monthly` into a map.
fn parse_price_map(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (price, plan) = pair.split_once('=')?;
            let price = price.trim();
            let plan = plan.trim();
            if price.is_empty() || plan.is_empty() {
                None
            } else {
                Some((price.to_string(), plan.to_string()))
            }
        })
        .collect()
}
