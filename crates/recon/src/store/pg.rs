//! Postgres store implementation.
//!
//! Maps the collaborator contract onto `orders`, `order_notes`,
//! `order_meta`, `subscriptions`, `subscription_notes` and
//! `capability_cache` tables (see the api crate's migrations). Idempotency
//! guards live in the SQL itself so concurrent invocations cannot both
//! apply a transition.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{ReconError, ReconResult};
use crate::store::{
    CapabilityStore, OrderId, OrderStatus, OrderStore, SubscriptionId, SubscriptionStatus,
    SubscriptionStore, META_PAYMENT_LOCK,
};

/// Postgres-backed implementation of all three store traits.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn order_row(&self, order: OrderId) -> ReconResult<(String, String, i64, Option<i64>)> {
        let row: Option<(String, String, i64, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT status, payment_method, total_cents, parent_id
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order.0)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| ReconError::Store(format!("order {order} not found")))
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn find_by_token(&self, token: &str) -> ReconResult<Option<OrderId>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM orders WHERE correlation_token = $1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| OrderId(id)))
    }

    async fn payment_method(&self, order: OrderId) -> ReconResult<String> {
        Ok(self.order_row(order).await?.1)
    }

    async fn status(&self, order: OrderId) -> ReconResult<OrderStatus> {
        self.order_row(order).await?.0.parse()
    }

    async fn update_status(
        &self,
        order: OrderId,
        status: OrderStatus,
        note: &str,
    ) -> ReconResult<()> {
        // The WHERE guard makes a same-status transition a no-op; the note
        // is recorded either way.
        sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status <> $2
            "#,
        )
        .bind(order.0)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if status == OrderStatus::Cancelled {
            self.delete_meta(order, META_PAYMENT_LOCK).await?;
        }

        OrderStore::add_note(self, order, note).await
    }

    async fn add_note(&self, order: OrderId, note: &str) -> ReconResult<()> {
        sqlx::query("INSERT INTO order_notes (order_id, note) VALUES ($1, $2)")
            .bind(order.0)
            .bind(note)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_payment_complete(
        &self,
        order: OrderId,
        transaction_id: Option<&str>,
    ) -> ReconResult<()> {
        // Only the first completion records a transaction id; replays are
        // silently absorbed.
        sqlx::query(
            r#"
            UPDATE orders
            SET status = 'processing',
                paid_transaction_id = $2,
                paid_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status NOT IN ('processing', 'completed')
            "#,
        )
        .bind(order.0)
        .bind(transaction_id)
        .execute(&self.pool)
        .await?;

        self.delete_meta(order, META_PAYMENT_LOCK).await
    }

    async fn get_meta(&self, order: OrderId, key: &str) -> ReconResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM order_meta WHERE order_id = $1 AND key = $2")
                .bind(order.0)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn set_meta(&self, order: OrderId, key: &str, value: &str) -> ReconResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_meta (order_id, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (order_id, key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(order.0)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_meta(&self, order: OrderId, key: &str) -> ReconResult<()> {
        sqlx::query("DELETE FROM order_meta WHERE order_id = $1 AND key = $2")
            .bind(order.0)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn needs_payment(&self, order: OrderId) -> ReconResult<bool> {
        let status = OrderStore::status(self, order).await?;
        Ok(matches!(status, OrderStatus::Pending | OrderStatus::Failed))
    }

    async fn amount_due_cents(&self, order: OrderId) -> ReconResult<i64> {
        Ok(self.order_row(order).await?.2)
    }

    async fn is_parent_order(&self, order: OrderId) -> ReconResult<bool> {
        Ok(self.order_row(order).await?.3.is_none())
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn find_by_profile(&self, profile_id: &str) -> ReconResult<Vec<SubscriptionId>> {
        let rows: Vec<(SubscriptionId,)> =
            sqlx::query_as("SELECT id FROM subscriptions WHERE billing_profile_id = $1")
                .bind(profile_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn payment_method(&self, subscription: SubscriptionId) -> ReconResult<String> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payment_method FROM subscriptions WHERE id = $1")
                .bind(subscription)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(method,)| method)
            .ok_or_else(|| ReconError::Store(format!("subscription {subscription} not found")))
    }

    async fn is_manual(&self, subscription: SubscriptionId) -> ReconResult<bool> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT manual_renewal FROM subscriptions WHERE id = $1")
                .bind(subscription)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(manual,)| manual)
            .ok_or_else(|| ReconError::Store(format!("subscription {subscription} not found")))
    }

    async fn status(&self, subscription: SubscriptionId) -> ReconResult<SubscriptionStatus> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM subscriptions WHERE id = $1")
                .bind(subscription)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| ReconError::Store(format!("subscription {subscription} not found")))?
            .0
            .parse()
    }

    async fn cancel(&self, subscription: SubscriptionId, note: &str) -> ReconResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1
              AND status NOT IN ('cancelled', 'expired')
            "#,
        )
        .bind(subscription)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            SubscriptionStore::add_note(self, subscription, note).await?;
        }
        Ok(())
    }

    async fn add_note(&self, subscription: SubscriptionId, note: &str) -> ReconResult<()> {
        sqlx::query("INSERT INTO subscription_notes (subscription_id, note) VALUES ($1, $2)")
            .bind(subscription)
            .bind(note)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_billing_profile(&self, subscription: SubscriptionId) -> ReconResult<()> {
        sqlx::query("UPDATE subscriptions SET billing_profile_id = NULL WHERE id = $1")
            .bind(subscription)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CapabilityStore for PgStore {
    async fn is_marked_enabled(&self, fingerprint: &str) -> ReconResult<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT enabled FROM capability_cache WHERE fingerprint = $1 AND permanent = TRUE",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some_and(|(enabled,)| enabled))
    }

    async fn mark_enabled(&self, fingerprint: &str) -> ReconResult<()> {
        sqlx::query(
            r#"
            INSERT INTO capability_cache (fingerprint, enabled, permanent, expires_at)
            VALUES ($1, TRUE, TRUE, NULL)
            ON CONFLICT (fingerprint) DO UPDATE
                SET enabled = TRUE, permanent = TRUE, expires_at = NULL
            "#,
        )
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cached_value(
        &self,
        fingerprint: &str,
        now: OffsetDateTime,
    ) -> ReconResult<Option<bool>> {
        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            SELECT enabled FROM capability_cache
            WHERE fingerprint = $1
              AND (permanent = TRUE OR expires_at > $2)
            "#,
        )
        .bind(fingerprint)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(enabled,)| enabled))
    }

    async fn cache_value(
        &self,
        fingerprint: &str,
        enabled: bool,
        expires_at: OffsetDateTime,
    ) -> ReconResult<()> {
        sqlx::query(
            r#"
            INSERT INTO capability_cache (fingerprint, enabled, permanent, expires_at)
            VALUES ($1, $2, FALSE, $3)
            ON CONFLICT (fingerprint) DO UPDATE
                SET enabled = EXCLUDED.enabled, expires_at = EXCLUDED.expires_at
            WHERE capability_cache.permanent = FALSE
            "#,
        )
        .bind(fingerprint)
        .bind(enabled)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invalidate(&self, fingerprint: &str) -> ReconResult<()> {
        sqlx::query("DELETE FROM capability_cache WHERE fingerprint = $1")
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
