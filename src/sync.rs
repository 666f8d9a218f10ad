//! Group definition sync from the configuration cache peer.

use tracing::{debug, info};

use crate::cache::{CacheState, Group};
use crate::dc::ConfigCache;

/// Pulls the current group set and reconciles additions, removals and
/// revision bumps. When the peer has nothing to offer the tick is skipped;
/// the next one retries.
pub fn update_groups(state: &mut CacheState, dc: &ConfigCache) {
    let old_revision = state.group_revision;

    let Some((configs, revision)) = dc.get_proxy_groups() else {
        debug!("configuration cache unavailable, skipping group sync");
        return;
    };
    state.group_revision = revision;

    // The pull refreshes sync_revision; anything left at zero afterwards
    // was removed upstream.
    for group in state.groups.values_mut() {
        group.sync_revision = 0;
    }

    for config in configs {
        let group = state
            .groups
            .entry(config.group_id)
            .or_insert_with(|| Group::new(config.group_id, config.failover_delay, config.min_online));
        group.failover_delay = config.failover_delay;
        group.min_online = config.min_online;
        group.revision = config.revision;
        group.sync_revision = revision;
    }

    let removed: Vec<u64> = state
        .groups
        .values()
        .filter(|group| group.sync_revision == 0)
        .map(|group| group.group_id)
        .collect();
    for group_id in removed {
        info!(group_id, "proxy group removed upstream");
        state.remove_group(group_id);
    }

    let changed: Vec<u64> = state
        .groups
        .values()
        .filter(|group| group.revision > old_revision)
        .map(|group| group.group_id)
        .collect();
    for group_id in changed {
        state.queue_group_update(group_id);
    }
}
