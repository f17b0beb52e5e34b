//! Reconciliation orchestrator.
//!
//! Turns a [`TransactionOutcome`] into order state transitions, and hosts
//! the scheduled-trigger entry point for renewal charges. Errors that reach
//! this layer terminate in a local order-state change plus an audit note;
//! they are never re-thrown past it (store failures excepted, since those
//! must surface as retryable).

use std::sync::Arc;

use crate::client::{ProcessorClient, ReferenceCharge};
use crate::config::ProcessorConfig;
use crate::error::ReconResult;
use crate::guard::PaymentGuard;
use crate::nvp::NA;
use crate::profile::{BillingProfile, FormatVersion, ProfileKind};
use crate::response::TransactionOutcome;
use crate::store::{OrderId, OrderStatus, OrderStore};

pub struct Reconciler {
    orders: Arc<dyn OrderStore>,
    guard: PaymentGuard,
    client: Arc<ProcessorClient>,
    config: Arc<ProcessorConfig>,
}

impl Reconciler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        guard: PaymentGuard,
        client: Arc<ProcessorClient>,
        config: Arc<ProcessorConfig>,
    ) -> Self {
        Self { orders, guard, client, config }
    }

    /// Apply a transaction outcome to an order.
    ///
    /// Safe to call twice with the same outcome: an already-paid order only
    /// gains a note, a held order in the hold status only gains a note, and
    /// a failed order stays failed.
    pub async fn reconcile(&self, order: OrderId, outcome: &TransactionOutcome) -> ReconResult<()> {
        if let Some(api_error) = &outcome.api_error {
            tracing::warn!(
                order = %order,
                code = %api_error.code,
                "charge rejected by processor"
            );
            self.orders
                .update_status(order, OrderStatus::Failed, &api_error.formatted())
                .await?;
            return Ok(());
        }

        if outcome.held() {
            let note = format!("Payment held: {}", outcome.status_message());
            if self.orders.status(order).await? == self.config.hold_status {
                // Already held; record the redelivery without re-triggering
                // the transition's side effects.
                self.orders.add_note(order, &note).await?;
            } else {
                self.orders
                    .update_status(order, self.config.hold_status, &note)
                    .await?;
            }
            return Ok(());
        }

        if !outcome.approved() {
            let note = format!("Payment declined: {}", outcome.status_message());
            self.orders
                .update_status(order, OrderStatus::Failed, &note)
                .await?;
            return Ok(());
        }

        let transaction_id = outcome.transaction_id.as_deref();

        // Gate on payment having been captured, not on needs_payment: a held
        // order does not need payment but must still complete when the
        // clearing approval arrives.
        if self.orders.status(order).await?.is_paid() {
            self.orders
                .add_note(
                    order,
                    &format!(
                        "Duplicate approval for transaction {} ignored; order is already paid.",
                        transaction_id.unwrap_or(NA)
                    ),
                )
                .await?;
            return Ok(());
        }

        self.orders
            .add_note(
                order,
                &format!("Payment approved (transaction ID {}).", transaction_id.unwrap_or(NA)),
            )
            .await?;
        self.orders.mark_payment_complete(order, transaction_id).await?;
        self.guard.release(order).await?;

        tracing::info!(
            order = %order,
            transaction_id = transaction_id.unwrap_or(NA),
            "payment reconciled"
        );
        Ok(())
    }

    /// Scheduled-trigger entry point: charge a renewal (or initial) order.
    ///
    /// The external scheduler calls this once per billing cycle. Suppression
    /// by the double-charge guard, a zero amount due, and profiles the
    /// processor charges itself all short-circuit before any network call.
    pub async fn process_renewal_payment(
        &self,
        order: OrderId,
        profile: &BillingProfile,
        reference_txns_enabled: bool,
    ) -> ReconResult<()> {
        if self.guard.applies(order, reference_txns_enabled).await?
            && self.guard.suppresses(order).await?
        {
            tracing::info!(order = %order, "capture suppressed by initial-payment lock");
            return Ok(());
        }

        if !self.orders.needs_payment(order).await? {
            tracing::info!(order = %order, "order no longer needs payment");
            return Ok(());
        }

        let amount_cents = self.orders.amount_due_cents(order).await?;
        if amount_cents == 0 {
            self.orders
                .add_note(order, "Zero amount due; order marked paid without a charge.")
                .await?;
            self.orders.mark_payment_complete(order, None).await?;
            self.guard.release(order).await?;
            return Ok(());
        }

        match profile.kind {
            ProfileKind::Unknown => {
                tracing::info!(order = %order, "manual renewal; no automatic capture");
                Ok(())
            }
            ProfileKind::StandardRecurring => {
                tracing::info!(
                    order = %order,
                    profile = %profile.id,
                    "processor-hosted profile; charge is initiated by the processor"
                );
                Ok(())
            }
            ProfileKind::ReferenceAgreement => {
                if profile.format == FormatVersion::Legacy {
                    self.orders
                        .add_note(
                            order,
                            &format!(
                                "Billing agreement {} uses a deprecated identifier format.",
                                profile.id
                            ),
                        )
                        .await?;
                }

                let charge = ReferenceCharge {
                    amount_cents,
                    currency: self.config.currency.clone(),
                    invoice_number: format!("{}{}", self.config.invoice_prefix, order),
                };

                match self.client.do_reference_transaction(&profile.id, &charge).await {
                    Ok(outcome) => self.reconcile(order, &outcome).await,
                    Err(err) => {
                        // Transport failures end here as a failed order, not
                        // a retry; the next billing cycle is the retry.
                        tracing::error!(order = %order, error = %err, "charge attempt failed");
                        self.orders
                            .update_status(
                                order,
                                OrderStatus::Failed,
                                &format!("Payment capture failed: {err}."),
                            )
                            .await
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::response::{ApiError, PaymentStatus, PaymentType};
    use crate::store::memory::MemoryStore;

    fn fixture(endpoint: Option<String>) -> (Reconciler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(ProcessorConfig::new(
            Credentials {
                username: "u".into(),
                password: "p".into(),
                signature: "s".into(),
            },
            true,
        ));
        let endpoint = endpoint.unwrap_or_else(|| "https://localhost:1/nvp".to_string());
        let client = Arc::new(ProcessorClient::with_endpoint(config.clone(), endpoint).unwrap());
        let guard = PaymentGuard::new(store.clone(), &config);
        (Reconciler::new(store.clone(), guard, client, config), store)
    }

    fn approved_outcome(txn: &str) -> TransactionOutcome {
        TransactionOutcome {
            status: PaymentStatus::Completed,
            transaction_id: Some(txn.to_string()),
            payment_type: PaymentType::Instant,
            ..TransactionOutcome::default()
        }
    }

    #[tokio::test]
    async fn reconcile_twice_is_idempotent() {
        let (reconciler, store) = fixture(None);
        let order = store.insert_order(OrderStatus::Pending, "paysync", 1999, true, None);
        let outcome = approved_outcome("TXN-1");

        reconciler.reconcile(order, &outcome).await.unwrap();
        reconciler.reconcile(order, &outcome).await.unwrap();

        assert_eq!(store.paid_transaction_id(order).as_deref(), Some("TXN-1"));
        assert_eq!(
            OrderStore::status(&*store, order).await.unwrap(),
            OrderStatus::Processing
        );
        // Second call only added a note.
        let notes = store.order_notes(order);
        assert_eq!(notes.len(), 2);
        assert!(notes[1].contains("Duplicate approval"));
    }

    #[tokio::test]
    async fn api_error_fails_order_with_formatted_note() {
        let (reconciler, store) = fixture(None);
        let order = store.insert_order(OrderStatus::Pending, "paysync", 1999, true, None);
        let outcome = TransactionOutcome {
            api_error: Some(ApiError {
                code: "10201".into(),
                message: "Agreement was canceled".into(),
            }),
            ..TransactionOutcome::default()
        };

        reconciler.reconcile(order, &outcome).await.unwrap();

        assert_eq!(
            OrderStore::status(&*store, order).await.unwrap(),
            OrderStatus::Failed
        );
        assert_eq!(store.order_notes(order), vec!["10201 Agreement was canceled.".to_string()]);
    }

    #[tokio::test]
    async fn held_outcome_moves_to_hold_then_notes_only() {
        let (reconciler, store) = fixture(None);
        let order = store.insert_order(OrderStatus::Pending, "paysync", 1999, true, None);
        let outcome = TransactionOutcome {
            status: PaymentStatus::Pending,
            pending_reason: Some("echeck".into()),
            ..TransactionOutcome::default()
        };

        reconciler.reconcile(order, &outcome).await.unwrap();
        assert_eq!(
            OrderStore::status(&*store, order).await.unwrap(),
            OrderStatus::OnHold
        );

        reconciler.reconcile(order, &outcome).await.unwrap();
        let notes = store.order_notes(order);
        assert_eq!(notes.len(), 2);
        assert!(notes.iter().all(|n| n.contains("Payment held: echeck")));
    }

    #[tokio::test]
    async fn held_order_completes_when_payment_clears() {
        let (reconciler, store) = fixture(None);
        let order = store.insert_order(OrderStatus::Pending, "paysync", 1999, true, None);
        let held = TransactionOutcome {
            status: PaymentStatus::Pending,
            pending_reason: Some("echeck".into()),
            transaction_id: Some("TX-EC".into()),
            ..TransactionOutcome::default()
        };

        reconciler.reconcile(order, &held).await.unwrap();
        assert_eq!(
            OrderStore::status(&*store, order).await.unwrap(),
            OrderStatus::OnHold
        );

        // The eCheck cleared: the approval must complete the held order,
        // not be dismissed as a redelivery.
        reconciler.reconcile(order, &approved_outcome("TX-EC")).await.unwrap();

        assert_eq!(
            OrderStore::status(&*store, order).await.unwrap(),
            OrderStatus::Processing
        );
        assert_eq!(store.paid_transaction_id(order).as_deref(), Some("TX-EC"));
    }

    #[tokio::test]
    async fn declined_outcome_fails_order() {
        let (reconciler, store) = fixture(None);
        let order = store.insert_order(OrderStatus::Pending, "paysync", 1999, true, None);
        let outcome = TransactionOutcome {
            status: PaymentStatus::Denied,
            ..TransactionOutcome::default()
        };

        reconciler.reconcile(order, &outcome).await.unwrap();

        assert_eq!(
            OrderStore::status(&*store, order).await.unwrap(),
            OrderStatus::Failed
        );
    }

    #[tokio::test]
    async fn zero_amount_renewal_skips_the_network() {
        // No mock server configured: any network call would error out.
        let (reconciler, store) = fixture(None);
        let order = store.insert_order(OrderStatus::Pending, "paysync", 0, false, None);
        let profile = BillingProfile {
            id: "B-123".into(),
            kind: ProfileKind::ReferenceAgreement,
            format: FormatVersion::Current,
        };

        reconciler
            .process_renewal_payment(order, &profile, true)
            .await
            .unwrap();

        assert!(!store.needs_payment(order).await.unwrap());
        assert!(store.order_notes(order)[0].contains("Zero amount due"));
    }

    #[tokio::test]
    async fn manual_and_processor_hosted_profiles_are_not_charged() {
        let (reconciler, store) = fixture(None);
        let order = store.insert_order(OrderStatus::Pending, "paysync", 1999, false, None);

        let manual = BillingProfile {
            id: String::new(),
            kind: ProfileKind::Unknown,
            format: FormatVersion::Current,
        };
        let hosted = BillingProfile {
            id: "I-ABC987".into(),
            kind: ProfileKind::StandardRecurring,
            format: FormatVersion::Current,
        };

        reconciler.process_renewal_payment(order, &manual, true).await.unwrap();
        reconciler.process_renewal_payment(order, &hosted, true).await.unwrap();

        assert!(store.needs_payment(order).await.unwrap());
        assert!(store.order_notes(order).is_empty());
    }

    #[tokio::test]
    async fn suppressed_order_is_not_charged() {
        let (reconciler, store) = fixture(None);
        let order = store.insert_order(OrderStatus::Pending, "paysync", 1999, true, None);
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        store
            .set_meta(order, crate::store::META_PAYMENT_LOCK, &now.to_string())
            .await
            .unwrap();
        let profile = BillingProfile {
            id: "B-123".into(),
            kind: ProfileKind::ReferenceAgreement,
            format: FormatVersion::Current,
        };

        // Would hit the (unreachable) endpoint if not suppressed.
        reconciler
            .process_renewal_payment(order, &profile, false)
            .await
            .unwrap();

        assert!(store.needs_payment(order).await.unwrap());
    }

    #[tokio::test]
    async fn successful_renewal_charge_reconciles_the_order() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/nvp")
            .with_body("ACK=Success&PAYMENTSTATUS=Completed&TRANSACTIONID=REN-77&PAYMENTTYPE=instant")
            .create_async()
            .await;

        let (reconciler, store) = fixture(Some(format!("{}/nvp", server.url())));
        let order = store.insert_order(OrderStatus::Pending, "paysync", 1999, false, None);
        let profile = BillingProfile {
            id: "B-123".into(),
            kind: ProfileKind::ReferenceAgreement,
            format: FormatVersion::Current,
        };

        reconciler
            .process_renewal_payment(order, &profile, true)
            .await
            .unwrap();

        assert_eq!(store.paid_transaction_id(order).as_deref(), Some("REN-77"));
    }

    #[tokio::test]
    async fn legacy_profile_gets_a_deprecation_note() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/nvp")
            .with_body("ACK=Success&PAYMENTSTATUS=Completed&TRANSACTIONID=REN-78")
            .create_async()
            .await;

        let (reconciler, store) = fixture(Some(format!("{}/nvp", server.url())));
        let order = store.insert_order(OrderStatus::Pending, "paysync", 1999, false, None);
        let profile = BillingProfile {
            id: "B-OLD".into(),
            kind: ProfileKind::ReferenceAgreement,
            format: FormatVersion::Legacy,
        };

        reconciler
            .process_renewal_payment(order, &profile, true)
            .await
            .unwrap();

        assert!(store.order_notes(order)[0].contains("deprecated identifier format"));
    }
}
