use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use lotledger_common::Platform;
use lotledger_store::ExternalIdentity;

use crate::traits::LotStore;

/// Resolves a raw handle to a stable (platform, handle) identity row.
/// Idempotent and independent of vehicle resolution: concurrent resolves of
/// the same handle converge through the store's conflict handling, not
/// application locks.
pub struct IdentityResolver {
    store: Arc<dyn LotStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn LotStore>) -> Self {
        Self { store }
    }

    /// Normalize and upsert. Returns the canonical identity row.
    pub async fn resolve(&self, platform: Platform, raw_handle: &str) -> Result<ExternalIdentity> {
        let handle = raw_handle.trim();
        let profile_url = platform.profile_url(handle);
        self.store
            .upsert_identity(platform.as_str(), handle, Some(&profile_url))
            .await
    }

    /// Bump last_seen for a handle already believed to exist. Insert races
    /// with a concurrent winner are non-fatal.
    pub async fn touch(&self, platform: Platform, raw_handle: &str) {
        let handle = raw_handle.trim();
        if let Err(e) = self.store.touch_identity(platform.as_str(), handle).await {
            warn!(platform = platform.as_str(), handle, error = %e, "Identity touch failed");
        }
    }
}
