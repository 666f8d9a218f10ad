//! Proxy online/offline classification and the group status state machine.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::cache::{CacheState, GroupFlags, GroupStatus, ProxyStatus};
use crate::dc::ConfigCache;

/// Update loop cadence in seconds.
pub const CHECK_INTERVAL: u64 = 5;

/// Refreshes proxy heartbeats from the configuration cache, classifies
/// every proxy, then runs the group state machine over the queued groups.
/// Runs under the cache lock.
pub fn evaluate(state: &mut CacheState, dc: &ConfigCache, now: u64) {
    let proxyids: Vec<u64> = state.proxies.keys().copied().collect();
    for (proxyid, lastaccess) in dc.proxy_lastaccess(&proxyids) {
        if let Some(proxy) = state.proxies.get_mut(&proxyid) {
            proxy.lastaccess = lastaccess;
        }
    }

    classify_proxies(state, now);

    // Groups in a transitional state keep re-evaluating until they settle,
    // even when none of their proxies changed this tick.
    let transitional: Vec<u64> = state
        .groups
        .values()
        .filter(|group| {
            matches!(
                group.status,
                GroupStatus::Unknown | GroupStatus::Recovery | GroupStatus::Decay
            )
        })
        .map(|group| group.group_id)
        .collect();
    for group_id in transitional {
        state.queue_group_update(group_id);
    }

    let queued = state.group_updates.clone();
    for group_id in queued {
        evaluate_group(state, group_id, now);
    }
}

fn classify_proxies(state: &mut CacheState, now: u64) {
    let delays: HashMap<u64, u64> = state
        .groups
        .values()
        .map(|group| (group.group_id, group.failover_delay))
        .collect();
    let startup_time = state.startup_time;

    let mut changed_groups = Vec::new();
    for proxy in state.proxies.values_mut() {
        let Some(&failover_delay) = delays.get(&proxy.group_id) else {
            continue;
        };

        let mut status = ProxyStatus::Unknown;
        if now.saturating_sub(proxy.lastaccess) >= failover_delay {
            if now.saturating_sub(startup_time) >= failover_delay {
                status = ProxyStatus::Offline;
                proxy.firstaccess = 0;
            }
            // Otherwise the process has not been up for a full failover
            // window yet; stay UNKNOWN instead of a false offline call.
        } else {
            if proxy.firstaccess == 0 {
                proxy.firstaccess = proxy.lastaccess;
            }
            if now.saturating_sub(proxy.firstaccess) >= failover_delay {
                status = ProxyStatus::Online;
            }
        }

        if status == ProxyStatus::Unknown || status == proxy.status {
            continue;
        }

        debug!(
            proxy_id = proxy.proxy_id,
            name = %proxy.name,
            from = ?proxy.status,
            to = ?status,
            "proxy status changed"
        );
        proxy.status = status;
        changed_groups.push(proxy.group_id);
    }

    for group_id in changed_groups {
        state.queue_group_update(group_id);
    }
}

fn evaluate_group(state: &mut CacheState, group_id: u64, now: u64) {
    let Some(group) = state.groups.get(&group_id) else {
        return;
    };

    let mut online = 0usize;
    let mut healthy = 0usize;
    for proxy_id in &group.proxies {
        let Some(proxy) = state.proxies.get(proxy_id) else {
            continue;
        };
        if proxy.status != ProxyStatus::Online {
            continue;
        }
        online += 1;
        // Comfortably inside the window even one tick from now.
        if now.saturating_sub(proxy.lastaccess) + CHECK_INTERVAL < group.failover_delay {
            healthy += 1;
        }
    }

    let min_online = group.min_online as usize;
    let proxies_num = group.proxies.len();

    let mut status = group.status;
    match group.status {
        GroupStatus::Unknown | GroupStatus::Online => {
            if group.status == GroupStatus::Unknown {
                status = GroupStatus::Online;
            }
            if min_online > healthy {
                status = GroupStatus::Decay;
            }
        }
        GroupStatus::Offline => {
            if min_online <= online {
                status = GroupStatus::Recovery;
            }
        }
        GroupStatus::Recovery => {
            if min_online > healthy {
                status = GroupStatus::Decay;
            } else if now.saturating_sub(group.status_time) > group.failover_delay
                || online == proxies_num
            {
                status = GroupStatus::Online;
            }
        }
        GroupStatus::Decay => {
            if min_online <= healthy {
                status = GroupStatus::Online;
            } else if min_online > online {
                status = GroupStatus::Offline;
            }
        }
    }

    if status == group.status {
        return;
    }

    info!(
        group_id,
        from = %group.status,
        to = %status,
        online,
        healthy,
        "proxy group status changed"
    );

    if let Some(group) = state.groups.get_mut(&group_id) {
        group.status = status;
        group.status_time = now;
        group.flags |= GroupFlags::UPDATE_STATUS;
    }
}
