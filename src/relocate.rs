//! Application of proxy relocation events.
//!
//! Events arrive on the cache's relocation queue from the IPC service.
//! Names of proxies not yet in the cache are resolved with one batch query;
//! the cache lock is released for the duration of that query and reacquired
//! before the queue is drained.

use std::collections::HashMap;

use tracing::debug;

use crate::cache::PgCache;
use crate::db::Store;
use crate::error::Result;

pub async fn apply_relocations(cache: &PgCache, store: &dyn Store) -> Result<()> {
    let mut unknown: Vec<u64> = Vec::new();
    {
        let state = cache.lock();
        for event in &state.relocated_proxies {
            if event.dstid == 0 {
                continue;
            }
            if !state.proxies.contains_key(&event.proxyid) {
                unknown.push(event.proxyid);
            }
        }
    }

    let mut names: HashMap<u64, String> = HashMap::new();
    if !unknown.is_empty() {
        unknown.sort_unstable();
        unknown.dedup();
        // Lock released around the query; the queue may keep growing.
        names = store.proxy_names(&unknown).await?.into_iter().collect();
    }

    let mut state = cache.lock();
    let events = std::mem::take(&mut state.relocated_proxies);
    for event in events {
        debug!(
            proxyid = event.proxyid,
            srcid = event.srcid,
            dstid = event.dstid,
            "applying proxy relocation"
        );

        let mut detached = None;
        if event.srcid != 0 && state.groups.contains_key(&event.srcid) {
            detached = state.remove_proxy(event.srcid, event.proxyid);
            state.queue_group_update(event.srcid);
        }

        if event.dstid != 0 {
            if state.groups.contains_key(&event.dstid) {
                match detached {
                    Some(proxy_id) => {
                        if let Some(proxy) = state.proxies.get_mut(&proxy_id) {
                            proxy.group_id = event.dstid;
                        }
                        if let Some(group) = state.groups.get_mut(&event.dstid) {
                            group.proxies.push(proxy_id);
                        }
                    }
                    None => {
                        let name = names
                            .get(&event.proxyid)
                            .map(String::as_str)
                            .unwrap_or("");
                        state.add_proxy(event.dstid, event.proxyid, name, 0);
                    }
                }
                state.queue_group_update(event.dstid);
            } else if detached.is_some() {
                // Destination vanished; release the proxy so nothing keeps
                // referencing a missing group.
                state.free_proxy(event.proxyid);
            }
        } else if detached.is_some() {
            state.free_proxy(event.proxyid);
        }
    }

    Ok(())
}
