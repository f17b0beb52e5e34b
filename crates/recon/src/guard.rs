//! Double-charge guard.
//!
//! Two independent triggers can try to capture a subscription's initial
//! payment: the scheduled background charge and the customer's browser
//! redirect back to the order-received page. When reference transactions are
//! not enabled, both paths go through the hosted checkout flow and can race.
//! The guard is a time-windowed soft lock stored as order meta: while a lock
//! is younger than the configured threshold, the scheduled path treats the
//! order as not needing payment.
//!
//! This is deliberately not a mutex. If the redirect-triggered capture is
//! still in flight when the window expires, a second attempt is no longer
//! suppressed; the threshold trades a small double-charge window against
//! never wedging an order behind a stale lock.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::config::ProcessorConfig;
use crate::error::ReconResult;
use crate::store::{OrderId, OrderStore, META_PAYMENT_LOCK};

#[derive(Clone)]
pub struct PaymentGuard {
    orders: Arc<dyn OrderStore>,
    threshold: Duration,
    gateway_id: String,
}

impl PaymentGuard {
    pub fn new(orders: Arc<dyn OrderStore>, config: &ProcessorConfig) -> Self {
        Self {
            orders,
            threshold: config.lock_threshold,
            gateway_id: config.gateway_id.clone(),
        }
    }

    /// The guard only protects initial (parent) orders paid through this
    /// gateway on the hosted-checkout path. Reference-transaction accounts
    /// never race: the scheduled charge is the only trigger.
    pub async fn applies(
        &self,
        order: OrderId,
        reference_txns_enabled: bool,
    ) -> ReconResult<bool> {
        if reference_txns_enabled {
            return Ok(false);
        }
        if self.orders.payment_method(order).await? != self.gateway_id {
            return Ok(false);
        }
        self.orders.is_parent_order(order).await
    }

    /// Acquire the lock on the order-received redirect. Returns whether a
    /// lock was written; orders that no longer need payment are left alone.
    pub async fn acquire(&self, order: OrderId) -> ReconResult<bool> {
        if !self.orders.needs_payment(order).await? {
            return Ok(false);
        }
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.orders
            .set_meta(order, META_PAYMENT_LOCK, &now.to_string())
            .await?;
        tracing::debug!(order = %order, acquired_at = now, "payment lock acquired");
        Ok(true)
    }

    /// Whether a live lock suppresses a capture attempt right now.
    pub async fn suppresses(&self, order: OrderId) -> ReconResult<bool> {
        self.suppresses_at(order, OffsetDateTime::now_utc()).await
    }

    /// Time-injectable variant of [`suppresses`](Self::suppresses).
    pub async fn suppresses_at(&self, order: OrderId, now: OffsetDateTime) -> ReconResult<bool> {
        let Some(raw) = self.orders.get_meta(order, META_PAYMENT_LOCK).await? else {
            return Ok(false);
        };

        let Ok(acquired_at) = raw.parse::<i64>() else {
            tracing::warn!(order = %order, raw = %raw, "unparseable payment lock value ignored");
            return Ok(false);
        };

        let age = now.unix_timestamp() - acquired_at;
        Ok(age < self.threshold.whole_seconds())
    }

    /// Remove the lock. Called when the order is paid or cancelled;
    /// harmless when no lock exists.
    pub async fn release(&self, order: OrderId) -> ReconResult<()> {
        self.orders.delete_meta(order, META_PAYMENT_LOCK).await
    }

    /// Store truth overridden by suppression: a locked order reports that
    /// it does not need payment, without its real state changing.
    pub async fn needs_payment(&self, order: OrderId) -> ReconResult<bool> {
        if self.suppresses(order).await? {
            return Ok(false);
        }
        self.orders.needs_payment(order).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::store::memory::MemoryStore;
    use crate::store::OrderStatus;

    fn guard_with_store() -> (PaymentGuard, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = ProcessorConfig::new(
            Credentials {
                username: "u".into(),
                password: "p".into(),
                signature: "s".into(),
            },
            true,
        );
        (PaymentGuard::new(store.clone(), &config), store)
    }

    async fn lock_aged(store: &MemoryStore, order: OrderId, age_secs: i64) {
        let acquired = OffsetDateTime::now_utc().unix_timestamp() - age_secs;
        store
            .set_meta(order, META_PAYMENT_LOCK, &acquired.to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lock_inside_window_suppresses_capture() {
        let (guard, store) = guard_with_store();
        let order = store.insert_order(OrderStatus::Pending, "paysync", 1999, true, None);
        lock_aged(&store, order, 170).await;

        assert!(guard.suppresses(order).await.unwrap());
        assert!(!guard.needs_payment(order).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_reflects_real_state() {
        let (guard, store) = guard_with_store();
        let order = store.insert_order(OrderStatus::Pending, "paysync", 1999, true, None);
        lock_aged(&store, order, 190).await;

        assert!(!guard.suppresses(order).await.unwrap());
        assert!(guard.needs_payment(order).await.unwrap());
    }

    #[tokio::test]
    async fn lock_is_absent_after_payment_completes() {
        let (guard, store) = guard_with_store();
        let order = store.insert_order(OrderStatus::Pending, "paysync", 1999, true, None);

        assert!(guard.acquire(order).await.unwrap());
        store.mark_payment_complete(order, Some("TXN-1")).await.unwrap();

        assert!(store.get_meta(order, META_PAYMENT_LOCK).await.unwrap().is_none());
        assert!(!guard.needs_payment(order).await.unwrap());
    }

    #[tokio::test]
    async fn acquire_skips_orders_not_needing_payment() {
        let (guard, store) = guard_with_store();
        let order = store.insert_order(OrderStatus::Processing, "paysync", 1999, true, None);

        assert!(!guard.acquire(order).await.unwrap());
        assert!(store.get_meta(order, META_PAYMENT_LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn guard_does_not_apply_to_renewal_orders_or_foreign_methods() {
        let (guard, store) = guard_with_store();
        let renewal = store.insert_order(OrderStatus::Pending, "paysync", 1999, false, None);
        let foreign = store.insert_order(OrderStatus::Pending, "card", 1999, true, None);
        let parent = store.insert_order(OrderStatus::Pending, "paysync", 1999, true, None);

        assert!(!guard.applies(renewal, false).await.unwrap());
        assert!(!guard.applies(foreign, false).await.unwrap());
        assert!(guard.applies(parent, false).await.unwrap());
        // Reference-transaction accounts never use the guard.
        assert!(!guard.applies(parent, true).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_lock_value_is_ignored() {
        let (guard, store) = guard_with_store();
        let order = store.insert_order(OrderStatus::Pending, "paysync", 1999, true, None);
        store
            .set_meta(order, META_PAYMENT_LOCK, "not-a-timestamp")
            .await
            .unwrap();

        assert!(!guard.suppresses(order).await.unwrap());
    }
}
