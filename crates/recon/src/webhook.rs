//! Webhook (IPN) handling.
//!
//! The processor pushes URL-encoded notifications with at-least-once
//! delivery. Events are routed by transaction type, then payment events by
//! an explicit match over the closed [`PaymentStatus`] enum. Every handler
//! must be a no-op (aside from an extra audit note) when the order or
//! subscription is already in the target state, because the same event can
//! arrive twice.
//!
//! Unrecognized transaction types and unresolvable correlation tokens are
//! validation errors: logged and acknowledged, never an order state change.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ProcessorConfig;
use crate::error::{ReconError, ReconResult};
use crate::guard::PaymentGuard;
use crate::nvp::{self, NA};
use crate::reconcile::Reconciler;
use crate::response::{PaymentStatus, PaymentType, TransactionOutcome};
use crate::store::{OrderId, OrderStore, SubscriptionStore};

/// A decoded notification. Never persisted verbatim; only its derived
/// effects (notes, status changes) are.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub txn_type: String,
    fields: HashMap<String, String>,
}

impl WebhookEvent {
    /// Decode a URL-encoded notification body. A payload without a
    /// transaction type cannot be routed and is rejected as validation.
    pub fn from_form(body: &str) -> ReconResult<Self> {
        let fields = nvp::decode(body);
        let txn_type = fields
            .get("txn_type")
            .cloned()
            .ok_or_else(|| ReconError::Validation("notification missing txn_type".to_string()))?;
        Ok(Self { txn_type, fields })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Opaque token resolving to a local order.
    pub fn correlation_token(&self) -> Option<&str> {
        self.get("custom")
    }

    /// Billing profile id, present on agreement-lifecycle events.
    pub fn profile_id(&self) -> Option<&str> {
        self.get("mp_id")
    }

    pub fn payment_status(&self) -> Option<&str> {
        self.get("payment_status")
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.get("txn_id")
    }

    pub fn pending_reason(&self) -> Option<&str> {
        self.get("pending_reason")
    }

    /// Sandbox deliveries carry the test flag.
    pub fn is_sandbox(&self) -> bool {
        self.get("test_ipn") == Some("1")
    }

    /// Gross amount in cents, when the notification carries one.
    pub fn gross_amount_cents(&self) -> Option<i64> {
        parse_amount_cents(self.get("mc_gross")?)
    }
}

/// Transaction type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    AgreementCreated,
    AgreementCancelled,
    Payment,
    Unknown,
}

impl TxnKind {
    pub fn classify(txn_type: &str) -> Self {
        match txn_type.to_ascii_lowercase().as_str() {
            "mp_signup" => TxnKind::AgreementCreated,
            "mp_cancel" => TxnKind::AgreementCancelled,
            "web_accept" | "cart" | "express_checkout" | "recurring_payment"
            | "subscr_payment" => TxnKind::Payment,
            _ => TxnKind::Unknown,
        }
    }
}

pub struct WebhookHandler {
    orders: Arc<dyn OrderStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    reconciler: Arc<Reconciler>,
    guard: PaymentGuard,
    config: Arc<ProcessorConfig>,
}

impl WebhookHandler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        reconciler: Arc<Reconciler>,
        guard: PaymentGuard,
        config: Arc<ProcessorConfig>,
    ) -> Self {
        Self { orders, subscriptions, reconciler, guard, config }
    }

    /// Route a verified notification.
    pub async fn handle(&self, event: &WebhookEvent) -> ReconResult<()> {
        match TxnKind::classify(&event.txn_type) {
            TxnKind::AgreementCreated => {
                tracing::info!(
                    profile = event.profile_id().unwrap_or(NA),
                    "billing agreement created; acknowledged"
                );
                Ok(())
            }
            TxnKind::AgreementCancelled => self.handle_agreement_cancelled(event).await,
            TxnKind::Payment => self.handle_payment(event).await,
            TxnKind::Unknown => {
                tracing::info!(
                    txn_type = %event.txn_type,
                    "unrecognized transaction type ignored"
                );
                Ok(())
            }
        }
    }

    /// The processor invalidated a billing agreement: cancel every
    /// subscription that still charges through it. Safe to run twice for
    /// the same profile id.
    async fn handle_agreement_cancelled(&self, event: &WebhookEvent) -> ReconResult<()> {
        let profile_id = event.profile_id().ok_or_else(|| {
            ReconError::Validation("agreement cancellation missing mp_id".to_string())
        })?;

        let subscriptions = self.subscriptions.find_by_profile(profile_id).await?;
        tracing::info!(
            profile = profile_id,
            count = subscriptions.len(),
            "billing agreement cancelled at the processor"
        );

        for subscription in subscriptions {
            if self.subscriptions.is_manual(subscription).await? {
                tracing::debug!(subscription = %subscription, "manual renewal; skipped");
                continue;
            }
            if self.subscriptions.payment_method(subscription).await? != self.config.gateway_id {
                tracing::debug!(subscription = %subscription, "foreign payment method; skipped");
                continue;
            }
            if self.subscriptions.status(subscription).await?.is_ended() {
                tracing::debug!(subscription = %subscription, "already ended; skipped");
                continue;
            }

            self.subscriptions
                .cancel(
                    subscription,
                    &format!("Billing agreement {profile_id} was cancelled at the processor."),
                )
                .await?;
            self.subscriptions.clear_billing_profile(subscription).await?;
            tracing::info!(subscription = %subscription, "subscription cancelled");
        }

        Ok(())
    }

    async fn handle_payment(&self, event: &WebhookEvent) -> ReconResult<()> {
        let token = event.correlation_token().ok_or_else(|| {
            ReconError::Validation("payment notification missing correlation token".to_string())
        })?;
        let order = self.orders.find_by_token(token).await?.ok_or_else(|| {
            ReconError::Validation(format!("no order for correlation token {token}"))
        })?;

        let raw_status = event.payment_status().unwrap_or("");
        let mut status = PaymentStatus::parse(raw_status);

        // Sandbox environments report a nominal "pending" for transactions
        // that are not actually held. Applied only to test-flagged traffic.
        if event.is_sandbox() && status == PaymentStatus::Pending {
            tracing::info!(
                order = %order,
                "sandbox notification: pending status coerced to completed"
            );
            status = PaymentStatus::Completed;
        }

        // Explicit dispatch over the closed status enum; a new status is a
        // visible gap here, not a silent miss.
        match status {
            PaymentStatus::Completed | PaymentStatus::Processed | PaymentStatus::InProgress => {
                self.payment_approved(order, status, event).await
            }
            PaymentStatus::Pending => self.payment_pending(order, event).await,
            PaymentStatus::Denied => self.payment_denied(order, event).await,
            PaymentStatus::Unknown => {
                tracing::warn!(
                    order = %order,
                    raw_status = raw_status,
                    "unrecognized payment status ignored"
                );
                Ok(())
            }
        }
    }

    async fn payment_approved(
        &self,
        order: OrderId,
        status: PaymentStatus,
        event: &WebhookEvent,
    ) -> ReconResult<()> {
        // A held order is not paid yet; the clearing approval must fall
        // through to reconciliation.
        if self.orders.status(order).await?.is_paid() {
            self.orders
                .add_note(
                    order,
                    &format!(
                        "Notification redelivered for paid order; transaction {} ignored.",
                        event.transaction_id().unwrap_or(NA)
                    ),
                )
                .await?;
            return Ok(());
        }

        // An amount mismatch is held for a human, never completed blindly.
        if let Some(gross_cents) = event.gross_amount_cents() {
            let due_cents = self.orders.amount_due_cents(order).await?;
            if gross_cents != due_cents {
                self.orders
                    .update_status(
                        order,
                        self.config.hold_status,
                        &format!(
                            "Notification amount {gross_cents}c does not match amount due {due_cents}c."
                        ),
                    )
                    .await?;
                return Ok(());
            }
        }

        let outcome = TransactionOutcome {
            status,
            transaction_id: event.transaction_id().map(str::to_string),
            payment_type: PaymentType::parse(event.get("payment_type").unwrap_or("")),
            ..TransactionOutcome::default()
        };
        self.reconciler.reconcile(order, &outcome).await?;
        self.guard.release(order).await
    }

    async fn payment_pending(&self, order: OrderId, event: &WebhookEvent) -> ReconResult<()> {
        let outcome = TransactionOutcome {
            status: PaymentStatus::Pending,
            transaction_id: event.transaction_id().map(str::to_string),
            pending_reason: event.pending_reason().map(str::to_string),
            ..TransactionOutcome::default()
        };
        self.reconciler.reconcile(order, &outcome).await
    }

    async fn payment_denied(&self, order: OrderId, event: &WebhookEvent) -> ReconResult<()> {
        let outcome = TransactionOutcome {
            status: PaymentStatus::Denied,
            transaction_id: event.transaction_id().map(str::to_string),
            ..TransactionOutcome::default()
        };
        self.reconciler.reconcile(order, &outcome).await
    }
}

/// Parse a decimal money string ("19.99") into cents. Returns `None` for
/// anything that does not look like money; the caller then skips the amount
/// check rather than failing the delivery.
fn parse_amount_cents(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    // Track the sign separately so "-0.50" keeps it; the whole part alone
    // parses to 0 and would lose it.
    let (negative, raw) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (whole, frac) = match raw.split_once('.') {
        Some((w, f)) => (w, f),
        None => (raw, ""),
    };
    let whole: i64 = whole.parse().ok()?;
    let cents_frac: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        2 => frac.parse().ok()?,
        _ => return None,
    };
    if whole < 0 || cents_frac < 0 {
        return None;
    }
    let cents = whole * 100 + cents_frac;
    Some(if negative { -cents } else { cents })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_transaction_types() {
        assert_eq!(TxnKind::classify("mp_signup"), TxnKind::AgreementCreated);
        assert_eq!(TxnKind::classify("mp_cancel"), TxnKind::AgreementCancelled);
        assert_eq!(TxnKind::classify("web_accept"), TxnKind::Payment);
        assert_eq!(TxnKind::classify("EXPRESS_CHECKOUT"), TxnKind::Payment);
        assert_eq!(TxnKind::classify("masspay"), TxnKind::Unknown);
    }

    #[test]
    fn event_requires_txn_type() {
        let err = WebhookEvent::from_form("payment_status=Completed").unwrap_err();
        assert!(matches!(err, ReconError::Validation(_)));
    }

    #[test]
    fn event_accessors_read_decoded_fields() {
        let event = WebhookEvent::from_form(
            "txn_type=web_accept&custom=tok-1&payment_status=Completed&txn_id=8XY&mc_gross=19.99&test_ipn=1",
        )
        .unwrap();
        assert_eq!(event.correlation_token(), Some("tok-1"));
        assert_eq!(event.transaction_id(), Some("8XY"));
        assert_eq!(event.gross_amount_cents(), Some(1999));
        assert!(event.is_sandbox());
    }

    #[test]
    fn amount_parsing() {
        assert_eq!(parse_amount_cents("19.99"), Some(1999));
        assert_eq!(parse_amount_cents("5"), Some(500));
        assert_eq!(parse_amount_cents("0.5"), Some(50));
        assert_eq!(parse_amount_cents("-3.25"), Some(-325));
        // Sign survives a zero whole part.
        assert_eq!(parse_amount_cents("-0.50"), Some(-50));
        assert_eq!(parse_amount_cents("12.345"), None);
        assert_eq!(parse_amount_cents("abc"), None);
    }
}
