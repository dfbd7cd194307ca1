//! API server configuration

use anyhow::Context;

/// Configuration for the API server, loaded from the environment.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Postgres connection string.
    pub database_url: String,
    /// Port the HTTP server binds on.
    pub port: u16,
    /// Stripe webhook signing secret (`whsec_...`).
    pub stripe_webhook_secret: String,
    /// Shared secret PayPal deliveries must present in the
    /// `x-webhook-secret` header.
    pub paypal_webhook_secret: String,
}

impl ApiConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid port number")?,
            stripe_webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .context("STRIPE_WEBHOOK_SECRET must be set")?,
            paypal_webhook_secret: std::env::var("PAYPAL_WEBHOOK_SECRET")
                .context("PAYPAL_WEBHOOK_SECRET must be set")?,
        })
    }
}
