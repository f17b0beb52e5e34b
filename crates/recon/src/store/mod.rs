//! Collaborator contract for the order/subscription aggregate.
//!
//! The engine never owns order or subscription records; it drives state
//! transitions through these traits. Two implementations ship with the
//! crate: [`memory::MemoryStore`] for tests and self-contained deployments,
//! and [`pg::PgStore`] backed by Postgres.
//!
//! State-conflict policy: re-applying a transition an order/subscription is
//! already in is a benign no-op at the store layer (the note is still
//! recorded). Webhook delivery is at-least-once, so every caller relies on
//! this.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ReconError, ReconResult};

/// Order meta key holding the initial-payment lock timestamp.
pub const META_PAYMENT_LOCK: &str = "_initial_payment_lock";
/// Order/subscription meta key holding the billing profile identifier.
pub const META_BILLING_PROFILE_ID: &str = "_billing_profile_id";

/// Identifier of an order in the external order store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OrderId(pub i64);

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a subscription in the external subscription store.
pub type SubscriptionId = Uuid;

/// Order lifecycle statuses the engine can observe or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderStatus {
    Pending,
    OnHold,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    /// Statuses meaning payment was already captured. A held order is NOT
    /// paid: the clearing notification must still be able to complete it.
    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            OrderStatus::Processing | OrderStatus::Completed | OrderStatus::Refunded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::OnHold => "on-hold",
            OrderStatus::Processing => "processing",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = ReconError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(OrderStatus::Pending),
            "on-hold" => Ok(OrderStatus::OnHold),
            "processing" => Ok(OrderStatus::Processing),
            "completed" => Ok(OrderStatus::Completed),
            "failed" => Ok(OrderStatus::Failed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "refunded" => Ok(OrderStatus::Refunded),
            other => Err(ReconError::Validation(format!("unknown order status: {other}"))),
        }
    }
}

/// Subscription lifecycle statuses the engine can observe or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubscriptionStatus {
    Active,
    OnHold,
    PendingCancel,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    /// Terminal statuses are never transitioned out of by this engine.
    pub fn is_ended(&self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled | SubscriptionStatus::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::OnHold => "on-hold",
            SubscriptionStatus::PendingCancel => "pending-cancel",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = ReconError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "active" => Ok(SubscriptionStatus::Active),
            "on-hold" => Ok(SubscriptionStatus::OnHold),
            "pending-cancel" => Ok(SubscriptionStatus::PendingCancel),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(ReconError::Validation(format!(
                "unknown subscription status: {other}"
            ))),
        }
    }
}

/// Order-side collaborator contract.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Resolve the order a webhook correlation token refers to.
    async fn find_by_token(&self, token: &str) -> ReconResult<Option<OrderId>>;

    async fn payment_method(&self, order: OrderId) -> ReconResult<String>;

    async fn status(&self, order: OrderId) -> ReconResult<OrderStatus>;

    /// Transition the order and record a note. A same-status transition
    /// records the note but skips the transition's side effects. Moving to
    /// `Cancelled` drops the initial-payment lock.
    async fn update_status(&self, order: OrderId, status: OrderStatus, note: &str)
        -> ReconResult<()>;

    async fn add_note(&self, order: OrderId, note: &str) -> ReconResult<()>;

    /// Mark the order paid, recording the processor transaction id.
    /// Idempotent: an already-paid order is left untouched. Removes the
    /// initial-payment lock, since a paid order no longer needs it.
    async fn mark_payment_complete(&self, order: OrderId, transaction_id: Option<&str>)
        -> ReconResult<()>;

    async fn get_meta(&self, order: OrderId, key: &str) -> ReconResult<Option<String>>;

    async fn set_meta(&self, order: OrderId, key: &str, value: &str) -> ReconResult<()>;

    async fn delete_meta(&self, order: OrderId, key: &str) -> ReconResult<()>;

    /// Raw store truth; the double-charge guard layers its suppression on
    /// top of this.
    async fn needs_payment(&self, order: OrderId) -> ReconResult<bool>;

    async fn amount_due_cents(&self, order: OrderId) -> ReconResult<i64>;

    /// Whether this is the subscription's initial (parent) order rather
    /// than a renewal order.
    async fn is_parent_order(&self, order: OrderId) -> ReconResult<bool>;
}

/// Subscription-side collaborator contract.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// All subscriptions whose stored billing profile id matches.
    async fn find_by_profile(&self, profile_id: &str) -> ReconResult<Vec<SubscriptionId>>;

    async fn payment_method(&self, subscription: SubscriptionId) -> ReconResult<String>;

    /// Whether the customer renews manually (no stored authorization).
    async fn is_manual(&self, subscription: SubscriptionId) -> ReconResult<bool>;

    async fn status(&self, subscription: SubscriptionId) -> ReconResult<SubscriptionStatus>;

    /// Cancel with an audit note. No-op when already ended.
    async fn cancel(&self, subscription: SubscriptionId, note: &str) -> ReconResult<()>;

    async fn add_note(&self, subscription: SubscriptionId, note: &str) -> ReconResult<()>;

    /// Drop the stored billing profile after the processor invalidates it.
    async fn clear_billing_profile(&self, subscription: SubscriptionId) -> ReconResult<()>;
}

/// Persistence for reference-transaction capability results.
#[async_trait]
pub trait CapabilityStore: Send + Sync {
    /// Whether the fingerprint is in the permanent positive set.
    async fn is_marked_enabled(&self, fingerprint: &str) -> ReconResult<bool>;

    /// Add the fingerprint to the permanent positive set.
    async fn mark_enabled(&self, fingerprint: &str) -> ReconResult<()>;

    /// Non-expired cached value, if any.
    async fn cached_value(
        &self,
        fingerprint: &str,
        now: time::OffsetDateTime,
    ) -> ReconResult<Option<bool>>;

    /// Cache a value until `expires_at`.
    async fn cache_value(
        &self,
        fingerprint: &str,
        enabled: bool,
        expires_at: time::OffsetDateTime,
    ) -> ReconResult<()>;

    /// Drop both the permanent mark and any cached entry.
    async fn invalidate(&self, fingerprint: &str) -> ReconResult<()>;
}
