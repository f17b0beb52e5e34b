// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PaySync Reconciliation Engine
//!
//! Keeps local subscription billing state consistent with an external
//! payment processor.
//!
//! ## Features
//!
//! - **NVP Client**: create billing agreements, capture reference
//!   transactions, probe account capability
//! - **Response Classification**: status, holds, eCheck clearing, fraud
//!   filter details
//! - **Capability Cache**: permanent positive / TTL-bounded negative cache
//!   keyed by credential fingerprint
//! - **Webhook Handling**: agreement lifecycle and payment notifications,
//!   idempotent under redelivery
//! - **Double-Charge Guard**: time-windowed lock around initial payments
//! - **Reconciliation**: transaction outcomes applied to order state with
//!   full audit notes

pub mod capability;
pub mod client;
pub mod config;
pub mod error;
pub mod guard;
pub mod nvp;
pub mod profile;
pub mod reconcile;
pub mod response;
pub mod store;
pub mod webhook;


pub use capability::CapabilityService;
pub use client::{BillingAgreementResult, ProcessorClient, ReferenceCharge};
pub use config::{Credentials, ProcessorConfig};
pub use error::{ReconError, ReconResult};
pub use guard::PaymentGuard;
pub use profile::{BillingProfile, FormatVersion, ProfileKind, ProfileResolver};
pub use reconcile::Reconciler;
pub use response::{ApiError, FraudFilter, PaymentStatus, PaymentType, TransactionOutcome};
pub use store::{
    CapabilityStore, OrderId, OrderStatus, OrderStore, SubscriptionId, SubscriptionStatus,
    SubscriptionStore,
};
pub use webhook::{TxnKind, WebhookEvent, WebhookHandler};

use std::sync::Arc;

/// Main reconciliation service that combines all engine functionality
pub struct ReconService {
    pub capability: CapabilityService,
    pub guard: PaymentGuard,
    pub reconciler: Arc<Reconciler>,
    pub resolver: ProfileResolver,
    pub webhooks: WebhookHandler,
    client: Arc<ProcessorClient>,
    config: Arc<ProcessorConfig>,
    orders: Arc<dyn OrderStore>,
}

impl ReconService {
    pub fn new(
        config: ProcessorConfig,
        orders: Arc<dyn OrderStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        capabilities: Arc<dyn CapabilityStore>,
    ) -> ReconResult<Self> {
        let config = Arc::new(config);
        let client = Arc::new(ProcessorClient::new(config.clone())?);
        Self::assemble(config, client, orders, subscriptions, capabilities)
    }

    /// Variant with an explicit endpoint, for pointing at a local mock
    /// server.
    pub fn with_endpoint(
        config: ProcessorConfig,
        endpoint: String,
        orders: Arc<dyn OrderStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        capabilities: Arc<dyn CapabilityStore>,
    ) -> ReconResult<Self> {
        let config = Arc::new(config);
        let client = Arc::new(ProcessorClient::with_endpoint(config.clone(), endpoint)?);
        Self::assemble(config, client, orders, subscriptions, capabilities)
    }

    fn assemble(
        config: Arc<ProcessorConfig>,
        client: Arc<ProcessorClient>,
        orders: Arc<dyn OrderStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        capabilities: Arc<dyn CapabilityStore>,
    ) -> ReconResult<Self> {
        let guard = PaymentGuard::new(orders.clone(), &config);
        let reconciler = Arc::new(Reconciler::new(
            orders.clone(),
            guard.clone(),
            client.clone(),
            config.clone(),
        ));
        let webhooks = WebhookHandler::new(
            orders.clone(),
            subscriptions,
            reconciler.clone(),
            guard.clone(),
            config.clone(),
        );
        let capability = CapabilityService::new(client.clone(), capabilities, config.clone());
        let resolver = ProfileResolver::new(&config);

        Ok(Self {
            capability,
            guard,
            reconciler,
            resolver,
            webhooks,
            client,
            config,
            orders,
        })
    }

    /// Checkout-completion entry point: exchange an approved checkout token
    /// for a billing agreement and store its id on the order.
    pub async fn establish_billing_agreement(
        &self,
        order: OrderId,
        token: &str,
    ) -> ReconResult<String> {
        let agreement = self.client.create_billing_agreement(token).await?;
        self.orders
            .set_meta(
                order,
                store::META_BILLING_PROFILE_ID,
                &agreement.billing_agreement_id,
            )
            .await?;
        self.orders
            .add_note(
                order,
                &format!("Billing agreement {} established.", agreement.billing_agreement_id),
            )
            .await?;
        Ok(agreement.billing_agreement_id)
    }

    /// Decode and handle a raw notification body.
    pub async fn handle_webhook(&self, body: &str) -> ReconResult<()> {
        let event = WebhookEvent::from_form(body)?;
        self.webhooks.handle(&event).await
    }

    /// Scheduled-trigger entry point: attempt to capture payment for a
    /// renewal (or initial) order against the stored profile identifier.
    pub async fn process_renewal_payment(
        &self,
        order: OrderId,
        profile_id: &str,
    ) -> ReconResult<()> {
        let profile = self.resolver.resolve(profile_id);
        let enabled = self.capability.is_enabled(false).await?;
        self.reconciler
            .process_renewal_payment(order, &profile, enabled)
            .await
    }

    /// Browser-redirect entry point: the customer landed on the
    /// order-received page. Acquires the double-charge lock when the guard
    /// applies to this order.
    pub async fn order_received(&self, order: OrderId) -> ReconResult<()> {
        let enabled = self.capability.is_enabled(false).await?;
        if self.guard.applies(order, enabled).await? {
            self.guard.acquire(order).await?;
        }
        Ok(())
    }

    /// Admin action: re-probe the capability, bypassing the cache.
    pub async fn recheck_capability(&self) -> ReconResult<bool> {
        self.capability.is_enabled(true).await
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn orders(&self) -> &Arc<dyn OrderStore> {
        &self.orders
    }
}
