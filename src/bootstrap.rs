//! One-shot cache population from the database at startup.

use std::collections::HashMap;

use tracing::{error, info};

use crate::cache::{HostMapping, PgCache, ProxyStatus};
use crate::db::Store;
use crate::dc::ConfigCache;
use crate::error::{PgmError, Result};
use crate::sync;

/// Loads the persisted revision, group definitions, host assignments,
/// proxies and host mappings into an empty cache. The rows are fetched
/// first; the cache is then populated under a single lock acquisition.
pub async fn load(cache: &PgCache, store: &dyn Store, dc: &ConfigCache) -> Result<()> {
    let revision = store.hpmap_revision().await?;
    let host_rows = store.host_groups().await?;
    let proxy_rows = store.proxies().await?;
    let mapping_rows = store.host_mappings().await?;

    let mut state = cache.lock();
    state.hpmap_revision = revision;

    sync::update_groups(&mut state, dc);

    for row in &host_rows {
        match state.groups.get_mut(&row.group_id) {
            Some(group) => group.hostids.push(row.hostid),
            None => {
                let err = PgmError::CacheInconsistent(format!(
                    "host {} references unknown proxy group {}",
                    row.hostid, row.group_id
                ));
                error!(error = %err, "skipping host row");
            }
        }
    }

    for row in &proxy_rows {
        if !state.groups.contains_key(&row.group_id) {
            let err = PgmError::CacheInconsistent(format!(
                "proxy {} references unknown proxy group {}",
                row.proxyid, row.group_id
            ));
            error!(error = %err, "skipping proxy row");
            continue;
        }
        // The persisted lastaccess is stowed in firstaccess until the
        // classification below clears it.
        state.add_proxy(row.group_id, row.proxyid, &row.name, row.lastaccess);
    }

    // Classify proxies against the freshest heartbeat on record rather than
    // the wall clock; the status evaluator takes over from the first tick.
    let clock = state
        .proxies
        .values()
        .map(|proxy| proxy.firstaccess)
        .max()
        .unwrap_or(0);
    let delays: HashMap<u64, u64> = state
        .groups
        .values()
        .map(|group| (group.group_id, group.failover_delay))
        .collect();
    for proxy in state.proxies.values_mut() {
        let Some(&failover_delay) = delays.get(&proxy.group_id) else {
            continue;
        };
        proxy.status = if clock.saturating_sub(proxy.firstaccess) >= failover_delay {
            ProxyStatus::Offline
        } else {
            ProxyStatus::Online
        };
        proxy.firstaccess = 0;
    }

    for row in mapping_rows {
        match state.proxies.get_mut(&row.proxyid) {
            Some(proxy) => {
                proxy.hosts.push(row.hostid);
                // Proxies with assigned hosts in most cases were online
                // before the restart.
                proxy.status = ProxyStatus::Online;
                state.hpmap.insert(
                    row.hostid,
                    HostMapping {
                        hostid: row.hostid,
                        proxyid: row.proxyid,
                        revision: row.revision,
                    },
                );
            }
            None => {
                // The row references a proxy we no longer know about.
                state.set_host_proxy(row.hostid, 0);
            }
        }
    }

    // Queue unmapped hosts for proxy assignment.
    let unmapped: Vec<(u64, u64)> = state
        .groups
        .values()
        .flat_map(|group| {
            group
                .hostids
                .iter()
                .filter(|hostid| !state.hpmap.contains_key(*hostid))
                .map(|&hostid| (group.group_id, hostid))
                .collect::<Vec<_>>()
        })
        .collect();
    for (group_id, hostid) in unmapped {
        if let Some(group) = state.groups.get_mut(&group_id) {
            group.new_hostids.push(hostid);
        }
    }

    info!(
        groups = state.groups.len(),
        proxies = state.proxies.len(),
        host_mappings = state.hpmap.len(),
        hpmap_revision = state.hpmap_revision,
        "proxy group cache loaded"
    );

    Ok(())
}
