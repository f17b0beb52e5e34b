//! In-memory store implementation.
//!
//! Backs the test suite and self-contained deployments that have no
//! database configured. Orders and subscriptions are plain records behind a
//! mutex; the semantics (same-status no-ops, idempotent payment completion)
//! match what the Postgres implementation enforces with SQL guards.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ReconError, ReconResult};
use crate::store::{
    CapabilityStore, OrderId, OrderStatus, OrderStore, SubscriptionId, SubscriptionStatus,
    SubscriptionStore, META_PAYMENT_LOCK,
};

#[derive(Debug, Clone)]
struct OrderRecord {
    status: OrderStatus,
    payment_method: String,
    total_cents: i64,
    parent: bool,
    correlation_token: Option<String>,
    paid_transaction_id: Option<String>,
    meta: HashMap<String, String>,
    notes: Vec<String>,
}

#[derive(Debug, Clone)]
struct SubscriptionRecord {
    status: SubscriptionStatus,
    payment_method: String,
    manual: bool,
    billing_profile_id: Option<String>,
    notes: Vec<String>,
}

#[derive(Debug, Clone)]
struct CapabilityRecord {
    enabled: bool,
    permanent: bool,
    expires_at: Option<OffsetDateTime>,
}

#[derive(Default)]
struct Inner {
    next_order_id: i64,
    orders: HashMap<OrderId, OrderRecord>,
    subscriptions: HashMap<SubscriptionId, SubscriptionRecord>,
    capability: HashMap<String, CapabilityRecord>,
}

/// HashMap-backed implementation of all three store traits.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an order and return its id.
    pub fn insert_order(
        &self,
        status: OrderStatus,
        payment_method: &str,
        total_cents: i64,
        parent: bool,
        correlation_token: Option<&str>,
    ) -> OrderId {
        let mut inner = self.lock();
        inner.next_order_id += 1;
        let id = OrderId(inner.next_order_id);
        inner.orders.insert(
            id,
            OrderRecord {
                status,
                payment_method: payment_method.to_string(),
                total_cents,
                parent,
                correlation_token: correlation_token.map(str::to_string),
                paid_transaction_id: None,
                meta: HashMap::new(),
                notes: Vec::new(),
            },
        );
        id
    }

    /// Insert a subscription and return its id.
    pub fn insert_subscription(
        &self,
        status: SubscriptionStatus,
        payment_method: &str,
        manual: bool,
        billing_profile_id: Option<&str>,
    ) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.lock().subscriptions.insert(
            id,
            SubscriptionRecord {
                status,
                payment_method: payment_method.to_string(),
                manual,
                billing_profile_id: billing_profile_id.map(str::to_string),
                notes: Vec::new(),
            },
        );
        id
    }

    /// Notes recorded against an order, for assertions.
    pub fn order_notes(&self, order: OrderId) -> Vec<String> {
        self.lock()
            .orders
            .get(&order)
            .map(|o| o.notes.clone())
            .unwrap_or_default()
    }

    /// Notes recorded against a subscription, for assertions.
    pub fn subscription_notes(&self, subscription: SubscriptionId) -> Vec<String> {
        self.lock()
            .subscriptions
            .get(&subscription)
            .map(|s| s.notes.clone())
            .unwrap_or_default()
    }

    /// Transaction id the order was paid with, if any.
    pub fn paid_transaction_id(&self, order: OrderId) -> Option<String> {
        self.lock()
            .orders
            .get(&order)
            .and_then(|o| o.paid_transaction_id.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        #[allow(clippy::unwrap_used)] // a poisoned test-store mutex is unrecoverable
        self.inner.lock().unwrap()
    }

    fn with_order<T>(
        &self,
        order: OrderId,
        f: impl FnOnce(&mut OrderRecord) -> T,
    ) -> ReconResult<T> {
        let mut inner = self.lock();
        let record = inner
            .orders
            .get_mut(&order)
            .ok_or_else(|| ReconError::Store(format!("order {order} not found")))?;
        Ok(f(record))
    }

    fn with_subscription<T>(
        &self,
        subscription: SubscriptionId,
        f: impl FnOnce(&mut SubscriptionRecord) -> T,
    ) -> ReconResult<T> {
        let mut inner = self.lock();
        let record = inner
            .subscriptions
            .get_mut(&subscription)
            .ok_or_else(|| ReconError::Store(format!("subscription {subscription} not found")))?;
        Ok(f(record))
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn find_by_token(&self, token: &str) -> ReconResult<Option<OrderId>> {
        Ok(self
            .lock()
            .orders
            .iter()
            .find(|(_, record)| record.correlation_token.as_deref() == Some(token))
            .map(|(id, _)| *id))
    }

    async fn payment_method(&self, order: OrderId) -> ReconResult<String> {
        self.with_order(order, |record| record.payment_method.clone())
    }

    async fn status(&self, order: OrderId) -> ReconResult<OrderStatus> {
        self.with_order(order, |record| record.status)
    }

    async fn update_status(
        &self,
        order: OrderId,
        status: OrderStatus,
        note: &str,
    ) -> ReconResult<()> {
        self.with_order(order, |record| {
            record.notes.push(note.to_string());
            if record.status != status {
                record.status = status;
            }
            if status == OrderStatus::Cancelled {
                record.meta.remove(META_PAYMENT_LOCK);
            }
        })
    }

    async fn add_note(&self, order: OrderId, note: &str) -> ReconResult<()> {
        self.with_order(order, |record| record.notes.push(note.to_string()))
    }

    async fn mark_payment_complete(
        &self,
        order: OrderId,
        transaction_id: Option<&str>,
    ) -> ReconResult<()> {
        self.with_order(order, |record| {
            if record.paid_transaction_id.is_none() && !matches!(
                record.status,
                OrderStatus::Processing | OrderStatus::Completed
            ) {
                record.paid_transaction_id = transaction_id.map(str::to_string);
                record.status = OrderStatus::Processing;
            }
            record.meta.remove(META_PAYMENT_LOCK);
        })
    }

    async fn get_meta(&self, order: OrderId, key: &str) -> ReconResult<Option<String>> {
        self.with_order(order, |record| record.meta.get(key).cloned())
    }

    async fn set_meta(&self, order: OrderId, key: &str, value: &str) -> ReconResult<()> {
        self.with_order(order, |record| {
            record.meta.insert(key.to_string(), value.to_string());
        })
    }

    async fn delete_meta(&self, order: OrderId, key: &str) -> ReconResult<()> {
        self.with_order(order, |record| {
            record.meta.remove(key);
        })
    }

    async fn needs_payment(&self, order: OrderId) -> ReconResult<bool> {
        self.with_order(order, |record| {
            matches!(record.status, OrderStatus::Pending | OrderStatus::Failed)
        })
    }

    async fn amount_due_cents(&self, order: OrderId) -> ReconResult<i64> {
        self.with_order(order, |record| record.total_cents)
    }

    async fn is_parent_order(&self, order: OrderId) -> ReconResult<bool> {
        self.with_order(order, |record| record.parent)
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn find_by_profile(&self, profile_id: &str) -> ReconResult<Vec<SubscriptionId>> {
        Ok(self
            .lock()
            .subscriptions
            .iter()
            .filter(|(_, record)| record.billing_profile_id.as_deref() == Some(profile_id))
            .map(|(id, _)| *id)
            .collect())
    }

    async fn payment_method(&self, subscription: SubscriptionId) -> ReconResult<String> {
        self.with_subscription(subscription, |record| record.payment_method.clone())
    }

    async fn is_manual(&self, subscription: SubscriptionId) -> ReconResult<bool> {
        self.with_subscription(subscription, |record| record.manual)
    }

    async fn status(&self, subscription: SubscriptionId) -> ReconResult<SubscriptionStatus> {
        self.with_subscription(subscription, |record| record.status)
    }

    async fn cancel(&self, subscription: SubscriptionId, note: &str) -> ReconResult<()> {
        self.with_subscription(subscription, |record| {
            if !record.status.is_ended() {
                record.status = SubscriptionStatus::Cancelled;
                record.notes.push(note.to_string());
            }
        })
    }

    async fn add_note(&self, subscription: SubscriptionId, note: &str) -> ReconResult<()> {
        self.with_subscription(subscription, |record| record.notes.push(note.to_string()))
    }

    async fn clear_billing_profile(&self, subscription: SubscriptionId) -> ReconResult<()> {
        self.with_subscription(subscription, |record| {
            record.billing_profile_id = None;
        })
    }
}

#[async_trait]
impl CapabilityStore for MemoryStore {
    async fn is_marked_enabled(&self, fingerprint: &str) -> ReconResult<bool> {
        Ok(self
            .lock()
            .capability
            .get(fingerprint)
            .is_some_and(|record| record.permanent && record.enabled))
    }

    async fn mark_enabled(&self, fingerprint: &str) -> ReconResult<()> {
        self.lock().capability.insert(
            fingerprint.to_string(),
            CapabilityRecord {
                enabled: true,
                permanent: true,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn cached_value(
        &self,
        fingerprint: &str,
        now: OffsetDateTime,
    ) -> ReconResult<Option<bool>> {
        Ok(self.lock().capability.get(fingerprint).and_then(|record| {
            if record.permanent {
                return Some(record.enabled);
            }
            match record.expires_at {
                Some(expires_at) if expires_at > now => Some(record.enabled),
                _ => None,
            }
        }))
    }

    async fn cache_value(
        &self,
        fingerprint: &str,
        enabled: bool,
        expires_at: OffsetDateTime,
    ) -> ReconResult<()> {
        self.lock().capability.insert(
            fingerprint.to_string(),
            CapabilityRecord {
                enabled,
                permanent: false,
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn invalidate(&self, fingerprint: &str) -> ReconResult<()> {
        self.lock().capability.remove(fingerprint);
        Ok(())
    }
}
