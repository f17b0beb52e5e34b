//! Engine configuration.
//!
//! One explicit struct, constructed once (usually from the environment) and
//! injected into every component. There are no global getters: components
//! that need a credential, a threshold, or the sandbox flag receive the
//! config in their constructor.

use sha2::{Digest, Sha256};
use time::Duration;

use crate::error::{ReconError, ReconResult};
use crate::store::OrderStatus;

/// Live and sandbox NVP endpoints.
const ENDPOINT_LIVE: &str = "https://api-3t.paypal.com/nvp";
const ENDPOINT_SANDBOX: &str = "https://api-3t.sandbox.paypal.com/nvp";

/// API credential triple for the NVP signature scheme.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub signature: String,
}

/// Configuration for the reconciliation engine.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub credentials: Credentials,
    /// Selects the sandbox endpoint and enables the sandbox IPN
    /// normalization rule.
    pub sandbox: bool,
    /// Identifier the order/subscription store uses for this gateway's
    /// payment method.
    pub gateway_id: String,
    /// ISO currency code sent with reference transactions.
    pub currency: String,
    /// Status an order is moved to when the processor holds a payment.
    pub hold_status: OrderStatus,
    /// Age under which an initial-payment lock suppresses a scheduled
    /// capture attempt.
    pub lock_threshold: Duration,
    /// How long a negative capability result is cached. Positive results
    /// are persisted permanently.
    pub capability_ttl: Duration,
    /// Prefix for invoice numbers sent to the processor.
    pub invoice_prefix: String,
    /// Profile identifier formats the processor has deprecated. Supplied
    /// by the operator; matching profiles are flagged `Legacy`.
    pub legacy_profile_denylist: Vec<String>,
}

impl ProcessorConfig {
    /// Build a config with defaults for everything but the credentials.
    pub fn new(credentials: Credentials, sandbox: bool) -> Self {
        Self {
            credentials,
            sandbox,
            gateway_id: "paysync".to_string(),
            currency: "USD".to_string(),
            hold_status: OrderStatus::OnHold,
            lock_threshold: Duration::seconds(180),
            capability_ttl: Duration::days(7),
            invoice_prefix: "PS-".to_string(),
            legacy_profile_denylist: Vec::new(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> ReconResult<Self> {
        let credentials = Credentials {
            username: require_env("PROCESSOR_API_USERNAME")?,
            password: require_env("PROCESSOR_API_PASSWORD")?,
            signature: require_env("PROCESSOR_API_SIGNATURE")?,
        };

        let sandbox = std::env::var("PROCESSOR_SANDBOX")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let mut config = Self::new(credentials, sandbox);

        if let Ok(raw) = std::env::var("PAYMENT_LOCK_THRESHOLD_SECS") {
            let secs: i64 = raw.parse().map_err(|_| {
                ReconError::Config(format!("PAYMENT_LOCK_THRESHOLD_SECS is not a number: {raw}"))
            })?;
            config.lock_threshold = Duration::seconds(secs);
        }

        if let Ok(raw) = std::env::var("CAPABILITY_CACHE_TTL_DAYS") {
            let days: i64 = raw.parse().map_err(|_| {
                ReconError::Config(format!("CAPABILITY_CACHE_TTL_DAYS is not a number: {raw}"))
            })?;
            config.capability_ttl = Duration::days(days);
        }

        if let Ok(raw) = std::env::var("ORDER_HOLD_STATUS") {
            config.hold_status = raw
                .parse()
                .map_err(|_| ReconError::Config(format!("unknown ORDER_HOLD_STATUS: {raw}")))?;
        }

        if let Ok(raw) = std::env::var("PROCESSOR_CURRENCY") {
            config.currency = raw;
        }

        if let Ok(raw) = std::env::var("LEGACY_PROFILE_DENYLIST") {
            config.legacy_profile_denylist = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(config)
    }

    /// NVP endpoint for the configured environment.
    pub fn endpoint(&self) -> &'static str {
        if self.sandbox {
            ENDPOINT_SANDBOX
        } else {
            ENDPOINT_LIVE
        }
    }

    /// Stable fingerprint of the credential set plus environment, used to
    /// key the capability cache. Capability is a property of the account,
    /// so changing credentials must invalidate cached results.
    pub fn credential_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.credentials.username.as_bytes());
        hasher.update(b":");
        hasher.update(self.credentials.password.as_bytes());
        hasher.update(b":");
        hasher.update(self.credentials.signature.as_bytes());
        hasher.update(if self.sandbox {
            &b":sandbox"[..]
        } else {
            &b":live"[..]
        });
        let digest = hex::encode(hasher.finalize());
        digest[..32].to_string()
    }
}

fn require_env(name: &str) -> ReconResult<String> {
    std::env::var(name).map_err(|_| ReconError::Config(format!("{name} must be set")))
}
