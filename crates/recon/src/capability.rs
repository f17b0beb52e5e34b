//! Reference-transaction capability cache.
//!
//! Checking whether an account can run merchant-initiated charges costs a
//! round trip to the processor, so results are cached. A positive result is
//! persisted permanently (capability does not regress without the store
//! manager acting), a negative result for a configurable TTL (capability can
//! be enabled later without notice). An explicit `bypass_cache` path exists
//! for the admin "recheck" action, and `invalidate` for credential changes.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::client::ProcessorClient;
use crate::config::ProcessorConfig;
use crate::error::ReconResult;
use crate::store::CapabilityStore;

pub struct CapabilityService {
    client: Arc<ProcessorClient>,
    store: Arc<dyn CapabilityStore>,
    config: Arc<ProcessorConfig>,
}

impl CapabilityService {
    pub fn new(
        client: Arc<ProcessorClient>,
        store: Arc<dyn CapabilityStore>,
        config: Arc<ProcessorConfig>,
    ) -> Self {
        Self { client, store, config }
    }

    /// Whether reference transactions are enabled for the configured
    /// account, consulting the cache before the network.
    pub async fn is_enabled(&self, bypass_cache: bool) -> ReconResult<bool> {
        let fingerprint = self.config.credential_fingerprint();

        if self.store.is_marked_enabled(&fingerprint).await? {
            return Ok(true);
        }

        let now = OffsetDateTime::now_utc();
        if !bypass_cache {
            if let Some(cached) = self.store.cached_value(&fingerprint, now).await? {
                return Ok(cached);
            }
        }

        let enabled = self.client.check_capability().await?;

        if enabled {
            self.store.mark_enabled(&fingerprint).await?;
            tracing::info!(
                fingerprint = %fingerprint,
                "reference transactions enabled; result persisted"
            );
        } else {
            let expires_at = now + self.config.capability_ttl;
            self.store.cache_value(&fingerprint, false, expires_at).await?;
            tracing::info!(
                fingerprint = %fingerprint,
                retry_after = %expires_at,
                "reference transactions not enabled; negative result cached"
            );
        }

        Ok(enabled)
    }

    /// Drop everything cached for the current credentials.
    pub async fn invalidate(&self) -> ReconResult<()> {
        self.store
            .invalidate(&self.config.credential_fingerprint())
            .await
    }
}
