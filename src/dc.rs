//! In-memory configuration cache peer.
//!
//! Holds the canonical runtime view of proxy group definitions and proxy
//! heartbeats. The manager consumes it every tick (group pull, lastaccess
//! refresh) and pushes host-mapping revision updates back after each flush.
//! The producer side is driven by the enclosing server; this process keeps
//! it fresh from the database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::db::Store;
use crate::error::Result;

/// One proxy group definition as published by the configuration cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupConfig {
    pub group_id: u64,
    pub failover_delay: u64,
    pub min_online: u32,
    /// Bumped whenever the group configuration changes.
    pub revision: u64,
}

#[derive(Debug, Default)]
struct DcState {
    groups: HashMap<u64, GroupConfig>,
    lastaccess: HashMap<u64, u64>,
    revision: u64,
    hpmap_revisions: HashMap<u64, u64>,
    hpmap_publishes: u64,
    initialized: bool,
}

/// Revisioned, lock-guarded view shared between the manager and the
/// configuration producers.
#[derive(Debug, Default)]
pub struct ConfigCache {
    state: RwLock<DcState>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk group pull. Returns `None` until the first publication; the
    /// caller skips the tick and retries. Groups absent from the returned
    /// set are removed upstream.
    pub fn get_proxy_groups(&self) -> Option<(Vec<GroupConfig>, u64)> {
        let state = self.state.read();
        if !state.initialized {
            return None;
        }
        Some((state.groups.values().copied().collect(), state.revision))
    }

    /// Latest heartbeat per requested proxy; proxies unknown to the cache
    /// are omitted.
    pub fn proxy_lastaccess(&self, proxyids: &[u64]) -> Vec<(u64, u64)> {
        let state = self.state.read();
        proxyids
            .iter()
            .filter_map(|id| state.lastaccess.get(id).map(|&at| (*id, at)))
            .collect()
    }

    /// Publishes the host-mapping revision for the listed groups so
    /// downstream views invalidate.
    pub fn update_group_hpmap_revision(&self, groupids: &[u64], revision: u64) {
        let mut state = self.state.write();
        state.hpmap_publishes += 1;
        for &group_id in groupids {
            state.hpmap_revisions.insert(group_id, revision);
        }
    }

    /// Replaces the group set. The cache revision is bumped and every group
    /// whose configuration changed inherits the new revision.
    pub fn publish_groups(&self, configs: &[(u64, u64, u32)]) {
        let mut state = self.state.write();
        state.revision += 1;
        let revision = state.revision;

        let mut groups = HashMap::with_capacity(configs.len());
        for &(group_id, failover_delay, min_online) in configs {
            let group_revision = match state.groups.get(&group_id) {
                Some(old) if old.failover_delay == failover_delay && old.min_online == min_online => {
                    old.revision
                }
                _ => revision,
            };
            groups.insert(
                group_id,
                GroupConfig {
                    group_id,
                    failover_delay,
                    min_online,
                    revision: group_revision,
                },
            );
        }
        state.groups = groups;
        state.initialized = true;
    }

    pub fn set_proxy_lastaccess(&self, proxyid: u64, lastaccess: u64) {
        self.state.write().lastaccess.insert(proxyid, lastaccess);
    }

    pub fn group_hpmap_revision(&self, group_id: u64) -> Option<u64> {
        self.state.read().hpmap_revisions.get(&group_id).copied()
    }

    /// Number of host-mapping revision publications received.
    pub fn hpmap_publish_count(&self) -> u64 {
        self.state.read().hpmap_publishes
    }

    /// One refresh of the producer side from the database.
    pub async fn refresh_from_store(&self, store: &dyn Store) -> Result<()> {
        let configs = store.proxy_group_configs().await?;
        let lastaccess = store.proxy_lastaccess().await?;

        let rows: Vec<(u64, u64, u32)> = configs
            .iter()
            .map(|cfg| (cfg.group_id, cfg.failover_delay, cfg.min_online))
            .collect();
        self.publish_groups(&rows);

        for (proxyid, at) in lastaccess {
            self.set_proxy_lastaccess(proxyid, at);
        }
        debug!(groups = rows.len(), "configuration cache refreshed");
        Ok(())
    }
}

/// Keeps the configuration cache in sync with the database until shutdown.
pub async fn run_refresher(
    dc: Arc<ConfigCache>,
    store: Arc<dyn Store>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        if let Err(err) = dc.refresh_from_store(store.as_ref()).await {
            error!(error = %err, "configuration cache refresh failed");
        }
    }
}
