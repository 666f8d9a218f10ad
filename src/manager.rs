//! The proxy group manager control loop.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bootstrap;
use crate::cache::PgCache;
use crate::db::Store;
use crate::dc::ConfigCache;
use crate::error::Result;
use crate::persist;
use crate::relocate;
use crate::status::{self, CHECK_INTERVAL};
use crate::sync;

/// Current wall clock in epoch seconds.
pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Single driver of the reconciliation cycle: group sync and status
/// evaluation every [`CHECK_INTERVAL`] seconds, relocation and persistence
/// every second.
pub struct ProxyGroupManager {
    cache: Arc<PgCache>,
    store: Arc<dyn Store>,
    dc: Arc<ConfigCache>,
    shutdown: CancellationToken,
}

impl ProxyGroupManager {
    pub fn new(store: Arc<dyn Store>, dc: Arc<ConfigCache>, shutdown: CancellationToken) -> Self {
        Self {
            cache: Arc::new(PgCache::new(epoch_now())),
            store,
            dc,
            shutdown,
        }
    }

    pub fn cache(&self) -> &Arc<PgCache> {
        &self.cache
    }

    pub async fn bootstrap(&self) -> Result<()> {
        bootstrap::load(&self.cache, self.store.as_ref(), &self.dc).await
    }

    /// One full reconciliation pass at the given wall clock: group sync,
    /// status evaluation, relocation and persistence.
    pub async fn tick(&self, now: u64) -> Result<()> {
        {
            let mut state = self.cache.lock();
            sync::update_groups(&mut state, &self.dc);
            status::evaluate(&mut state, &self.dc, now);
        }

        if self.cache.has_relocations() {
            relocate::apply_relocations(&self.cache, self.store.as_ref()).await?;
        }

        if self.cache.has_group_updates() {
            persist::flush_updates(&self.cache, self.store.as_ref(), &self.dc).await?;
        }

        Ok(())
    }

    /// Bootstraps the cache and drives the loop until cancellation.
    pub async fn run(&self) -> Result<()> {
        self.bootstrap().await?;

        info!("proxy group manager started");

        let mut time_update = epoch_now();

        while !self.shutdown.is_cancelled() {
            let now = epoch_now();

            if now.saturating_sub(time_update) >= CHECK_INTERVAL {
                let mut state = self.cache.lock();
                sync::update_groups(&mut state, &self.dc);
                status::evaluate(&mut state, &self.dc, now);
                drop(state);
                time_update = now;
            }

            if self.cache.has_relocations() {
                if let Err(err) =
                    relocate::apply_relocations(&self.cache, self.store.as_ref()).await
                {
                    error!(error = %err, "cannot apply proxy relocations");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = self.shutdown.cancelled() => break,
            }

            if self.cache.has_group_updates() {
                if let Err(err) =
                    persist::flush_updates(&self.cache, self.store.as_ref(), &self.dc).await
                {
                    error!(error = %err, "cannot flush proxy group updates");
                }
            }
        }

        info!("proxy group manager stopped");
        Ok(())
    }
}
