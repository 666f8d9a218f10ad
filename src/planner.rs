//! Host placement over the online proxies of a group.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::cache::{CacheState, ProxyStatus};

/// Assigns a group's unplaced hosts to its online proxies with a
/// deterministic balanced placement: the proxy with the fewest hosts wins
/// each host, ties broken by ascending proxy id. With no online proxies the
/// hosts stay queued for a later tick.
pub(crate) fn assign_new_hosts(state: &mut CacheState, group_id: u64) {
    let Some(group) = state.groups.get(&group_id) else {
        return;
    };
    if group.new_hostids.is_empty() {
        return;
    }

    let mut candidates: BinaryHeap<Reverse<(usize, u64)>> = group
        .proxies
        .iter()
        .filter_map(|proxy_id| state.proxies.get(proxy_id))
        .filter(|proxy| proxy.status == ProxyStatus::Online)
        .map(|proxy| Reverse((proxy.hosts.len(), proxy.proxy_id)))
        .collect();

    if candidates.is_empty() {
        return;
    }

    let hostids = match state.groups.get_mut(&group_id) {
        Some(group) => std::mem::take(&mut group.new_hostids),
        None => return,
    };

    for hostid in hostids {
        let Some(Reverse((hosts, proxy_id))) = candidates.pop() else {
            break;
        };
        state.set_host_proxy(hostid, proxy_id);
        candidates.push(Reverse((hosts + 1, proxy_id)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Group;

    fn setup(min_online: u32) -> CacheState {
        let mut state = CacheState::default();
        state.groups.insert(1, Group::new(1, 60, min_online));
        state
    }

    fn online(state: &mut CacheState, proxy_id: u64) {
        state.proxies.get_mut(&proxy_id).unwrap().status = ProxyStatus::Online;
    }

    #[test]
    fn balances_hosts_over_online_proxies() {
        let mut state = setup(1);
        for proxy_id in [10, 11, 12] {
            state.add_proxy(1, proxy_id, "p", 0);
            online(&mut state, proxy_id);
        }
        state.groups.get_mut(&1).unwrap().new_hostids = (100..106).collect();

        assign_new_hosts(&mut state, 1);

        for proxy_id in [10, 11, 12] {
            assert_eq!(state.proxies[&proxy_id].hosts.len(), 2);
        }
        assert!(state.groups[&1].new_hostids.is_empty());
        assert_eq!(state.hosts_new.len(), 6);
    }

    #[test]
    fn prefers_lightest_proxy_then_lowest_id() {
        let mut state = setup(1);
        for proxy_id in [11, 10] {
            state.add_proxy(1, proxy_id, "p", 0);
            online(&mut state, proxy_id);
        }
        // Proxy 11 already owns a host; 10 must win the next placement.
        state.set_host_proxy(200, 11);
        state.groups.get_mut(&1).unwrap().new_hostids = vec![100, 101];

        assign_new_hosts(&mut state, 1);

        assert_eq!(state.proxies[&10].hosts, vec![100, 101]);
    }

    #[test]
    fn ties_break_by_ascending_proxy_id() {
        let mut state = setup(1);
        for proxy_id in [12, 10, 11] {
            state.add_proxy(1, proxy_id, "p", 0);
            online(&mut state, proxy_id);
        }
        state.groups.get_mut(&1).unwrap().new_hostids = vec![100];

        assign_new_hosts(&mut state, 1);

        assert_eq!(state.proxies[&10].hosts, vec![100]);
    }

    #[test]
    fn defers_with_no_online_proxies() {
        let mut state = setup(1);
        state.add_proxy(1, 10, "p", 0);
        state.groups.get_mut(&1).unwrap().new_hostids = vec![100, 101];

        assign_new_hosts(&mut state, 1);

        assert_eq!(state.groups[&1].new_hostids, vec![100, 101]);
        assert!(state.hosts_new.is_empty());
    }
}
