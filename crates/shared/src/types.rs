//! Core billing types shared across crates.

use serde::{Deserialize, Serialize};

/// Subscription plan tier.
///
/// Ordering matters: `Free < Premium < Pro`. The reconciler uses this
/// ordering to decide whether a plan change is an upgrade (eligible for a
/// one-time bonus grant) or a downgrade (credits untouched).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Premium,
    Pro,
}

impl Default for PlanTier {
    fn default() -> Self {
        Self::Free
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanTier::Free => write!(f, "free"),
            PlanTier::Premium => write!(f, "premium"),
            PlanTier::Pro => write!(f, "pro"),
        }
    }
}

impl std::str::FromStr for PlanTier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(PlanTier::Free),
            "premium" => Ok(PlanTier::Premium),
            "pro" => Ok(PlanTier::Pro),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognized tier string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown plan tier: {0}")]
pub struct UnknownTier(pub String);

impl PlanTier {
    /// Derive a tier from a provider plan-key hint such as `pro_monthly`
    /// or a PayPal plan id containing `premium`.
    ///
    /// Unknown keys map to `Free`, matching how unmapped provider prices
    /// are treated: no hint, no paid entitlement.
    pub fn from_plan_key(key: &str) -> Self {
        let key = key.to_ascii_lowercase();
        if key.contains("pro") {
            PlanTier::Pro
        } else if key.contains("premium") {
            PlanTier::Premium
        } else {
            PlanTier::Free
        }
    }

    /// The static capability table for this tier.
    pub fn limits(&self) -> PlanLimits {
        match self {
            PlanTier::Free => PlanLimits {
                name: "Free Starter",
                max_video_duration_secs: 8,
                can_upload_music: false,
                music_library: MusicLibrary::Basic,
                cloud_save: false,
                max_projects: 3,
                ai_credit_ceiling: 100,
            },
            PlanTier::Premium => PlanLimits {
                name: "Premium Creator",
                max_video_duration_secs: 13,
                can_upload_music: true,
                music_library: MusicLibrary::Varied,
                cloud_save: true,
                max_projects: 20,
                ai_credit_ceiling: 1_000,
            },
            PlanTier::Pro => PlanLimits {
                name: "Pro Studio",
                max_video_duration_secs: 18,
                can_upload_music: true,
                music_library: MusicLibrary::Unlimited,
                cloud_save: true,
                max_projects: 9_999,
                ai_credit_ceiling: u32::MAX,
            },
        }
    }
}

/// Which music library a tier can pull from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MusicLibrary {
    Basic,
    Varied,
    Unlimited,
}

/// Fixed feature limits for a tier. A lookup table, never computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Marketing name of the plan.
    pub name: &'static str,
    /// Maximum render duration in seconds.
    pub max_video_duration_secs: u32,
    /// Whether the user may upload their own music tracks.
    pub can_upload_music: bool,
    /// Which music library the tier unlocks.
    pub music_library: MusicLibrary,
    /// Whether projects are saved to cloud storage.
    pub cloud_save: bool,
    /// Maximum number of saved projects.
    pub max_projects: u32,
    /// Ceiling on AI credits spendable per billing period.
    pub ai_credit_ceiling: u32,
}

/// Payment provider that a subscription lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Stripe,
    PayPal,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Stripe => write!(f, "stripe"),
            Provider::PayPal => write!(f, "paypal"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(Provider::Stripe),
            "paypal" => Ok(Provider::PayPal),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognized provider string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown payment provider: {0}")]
pub struct UnknownProvider(pub String);

/// Provider-reported subscription lifecycle state.
///
/// `none → pending_approval → active → {past_due, canceled, unpaid}`.
/// Only `Active` ever maps to a paid tier; every degraded or terminal
/// state maps the account back to `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    PendingApproval,
    Active,
    PastDue,
    Canceled,
    Unpaid,
}

impl SubscriptionStatus {
    /// Whether this status entitles the account to a paid tier.
    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionStatus::PendingApproval => write!(f, "pending_approval"),
            SubscriptionStatus::Active => write!(f, "active"),
            SubscriptionStatus::PastDue => write!(f, "past_due"),
            SubscriptionStatus::Canceled => write!(f, "canceled"),
            SubscriptionStatus::Unpaid => write!(f, "unpaid"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // Stripe vocabulary. "trialing" and "incomplete" are states a
            // subscription can sit in before first payment clears.
            "pending_approval" | "incomplete" | "trialing" => Ok(Self::PendingApproval),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" | "cancelled" | "incomplete_expired" | "expired" | "suspended" => {
                Ok(Self::Canceled)
            }
            "unpaid" => Ok(Self::Unpaid),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognized subscription status.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown subscription status: {0}")]
pub struct UnknownStatus(pub String);
