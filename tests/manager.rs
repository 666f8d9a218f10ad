//! End-to-end reconciliation scenarios against the in-memory store.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use common::MemStore;
use pgroupd::cache::{GroupStatus, ProxyRelocation, ProxyStatus};
use pgroupd::dc::ConfigCache;
use pgroupd::manager::ProxyGroupManager;

const T0: u64 = 10_000;

fn manager(store: &Arc<MemStore>, dc: &Arc<ConfigCache>) -> ProxyGroupManager {
    let manager = ProxyGroupManager::new(store.clone(), dc.clone(), CancellationToken::new());
    // Scenarios use synthetic clocks; backdate the process start so the
    // startup grace window is over.
    manager.cache().lock().startup_time = 0;
    manager
}

#[tokio::test]
async fn cold_start_with_stale_proxies_rewrites_nothing() {
    let store = MemStore::new();
    store.add_group(1, 60, 1);
    store.add_proxy(10, Some(1), "edge-a", T0 - 600);
    store.add_proxy(11, Some(1), "edge-b", T0 - 660);

    let dc = Arc::new(ConfigCache::new());
    dc.publish_groups(&[(1, 60, 1)]);
    dc.set_proxy_lastaccess(10, T0 - 600);
    dc.set_proxy_lastaccess(11, T0 - 660);

    let manager = manager(&store, &dc);
    manager.bootstrap().await.unwrap();

    {
        let state = manager.cache().lock();
        // The bootstrap classification is relative to the freshest
        // heartbeat on record.
        assert_eq!(state.proxies[&11].status, ProxyStatus::Offline);
        assert_eq!(state.hpmap_revision, 0);
    }

    manager.tick(T0).await.unwrap();

    let state = manager.cache().lock();
    assert_eq!(state.proxies[&10].status, ProxyStatus::Offline);
    assert_eq!(state.proxies[&11].status, ProxyStatus::Offline);
    assert_eq!(state.hpmap_revision, 0);
    drop(state);

    let db = store.db();
    assert!(db.host_proxy.is_empty());
    assert!(db.insert_batches.is_empty());
    assert_eq!(db.ids_revision, Some(0));
}

#[tokio::test]
async fn group_decays_into_offline_when_quorum_is_lost() {
    let store = MemStore::new();
    store.add_group(1, 60, 2);
    for (proxyid, name) in [(10, "edge-a"), (11, "edge-b"), (12, "edge-c")] {
        store.add_proxy(proxyid, Some(1), name, T0);
    }

    let dc = Arc::new(ConfigCache::new());
    dc.publish_groups(&[(1, 60, 2)]);
    for proxyid in [10, 11, 12] {
        dc.set_proxy_lastaccess(proxyid, T0);
    }

    let manager = manager(&store, &dc);
    manager.bootstrap().await.unwrap();

    manager.tick(T0 + 1).await.unwrap();
    assert_eq!(
        manager.cache().group_status(1),
        Some((GroupStatus::Online, T0 + 1))
    );

    // Two of three proxies stop heartbeating.
    dc.set_proxy_lastaccess(12, T0 + 69);
    manager.tick(T0 + 70).await.unwrap();
    assert_eq!(
        manager.cache().group_status(1),
        Some((GroupStatus::Decay, T0 + 70))
    );

    dc.set_proxy_lastaccess(12, T0 + 74);
    manager.tick(T0 + 75).await.unwrap();
    assert_eq!(
        manager.cache().group_status(1),
        Some((GroupStatus::Offline, T0 + 75))
    );

    assert_eq!(store.db().groups[&1].2, GroupStatus::Offline.as_db());
}

#[tokio::test]
async fn offline_group_recovers_through_full_quorum() {
    let store = MemStore::new();
    store.add_group(1, 60, 1);
    store.add_proxy(10, Some(1), "edge-a", T0 - 600);

    let dc = Arc::new(ConfigCache::new());
    dc.publish_groups(&[(1, 60, 1)]);
    dc.set_proxy_lastaccess(10, T0 - 600);

    let manager = manager(&store, &dc);
    manager.bootstrap().await.unwrap();

    manager.tick(T0).await.unwrap();
    manager.tick(T0 + 5).await.unwrap();
    assert_eq!(manager.cache().lock().proxies[&10].status, ProxyStatus::Offline);
    assert_eq!(
        manager.cache().group_status(1).map(|(status, _)| status),
        Some(GroupStatus::Offline)
    );

    // Heartbeats resume; the proxy stays observing for a full window.
    let resume = T0 + 100;
    dc.set_proxy_lastaccess(10, resume - 1);
    manager.tick(resume).await.unwrap();
    assert_eq!(manager.cache().lock().proxies[&10].status, ProxyStatus::Offline);
    assert_eq!(
        manager.cache().group_status(1).map(|(status, _)| status),
        Some(GroupStatus::Offline)
    );

    dc.set_proxy_lastaccess(10, resume + 59);
    manager.tick(resume + 60).await.unwrap();
    assert_eq!(manager.cache().lock().proxies[&10].status, ProxyStatus::Online);
    assert_eq!(
        manager.cache().group_status(1).map(|(status, _)| status),
        Some(GroupStatus::Recovery)
    );

    // Every proxy of the group is online: recovery completes.
    dc.set_proxy_lastaccess(10, resume + 64);
    manager.tick(resume + 65).await.unwrap();
    assert_eq!(
        manager.cache().group_status(1).map(|(status, _)| status),
        Some(GroupStatus::Online)
    );
}

#[tokio::test]
async fn relocation_insert_then_delete_in_one_pass() {
    let store = MemStore::new();
    store.add_group(7, 60, 1);
    store.add_proxy(5, None, "edge-5", 0);

    let dc = Arc::new(ConfigCache::new());
    dc.publish_groups(&[(7, 60, 1)]);

    let manager = manager(&store, &dc);
    manager.bootstrap().await.unwrap();

    manager.cache().queue_relocation(ProxyRelocation {
        proxyid: 5,
        srcid: 0,
        dstid: 7,
    });
    manager.cache().queue_relocation(ProxyRelocation {
        proxyid: 5,
        srcid: 7,
        dstid: 0,
    });

    manager.tick(T0).await.unwrap();

    let state = manager.cache().lock();
    assert!(state.proxies.is_empty());
    assert!(state.groups[&7].proxies.is_empty());
    assert!(state.relocated_proxies.is_empty());
}

#[tokio::test]
async fn detached_proxy_returns_its_hosts_for_replanning() {
    let store = MemStore::new();
    store.add_group(7, 60, 1);
    store.add_proxy(9, Some(7), "edge-9", T0);
    store.add_host(100, 7);
    {
        let mut db = store.db();
        db.host_proxy.insert(100, (9, 1));
        db.ids_revision = Some(1);
    }

    let dc = Arc::new(ConfigCache::new());
    dc.publish_groups(&[(7, 60, 1)]);
    dc.set_proxy_lastaccess(9, T0);

    let manager = manager(&store, &dc);
    manager.bootstrap().await.unwrap();
    assert_eq!(manager.cache().host_proxy(100).map(|m| m.proxyid), Some(9));

    manager.cache().queue_relocation(ProxyRelocation {
        proxyid: 9,
        srcid: 7,
        dstid: 0,
    });
    manager.tick(T0 + 1).await.unwrap();

    let state = manager.cache().lock();
    assert!(!state.proxies.contains_key(&9));
    // No online proxy is left, so the host stays queued for placement.
    assert_eq!(state.groups[&7].new_hostids, vec![100]);
    drop(state);

    assert!(store.db().host_proxy.is_empty());
}

#[tokio::test]
async fn inserts_cross_the_batch_boundary_atomically() {
    let store = MemStore::new();
    store.add_group(1, 60, 1);
    for (proxyid, name) in [(10, "edge-a"), (11, "edge-b"), (12, "edge-c")] {
        store.add_proxy(proxyid, Some(1), name, T0);
    }
    for hostid in 0..2_500u64 {
        store.add_host(100_000 + hostid, 1);
    }

    let dc = Arc::new(ConfigCache::new());
    dc.publish_groups(&[(1, 60, 1)]);
    for proxyid in [10, 11, 12] {
        dc.set_proxy_lastaccess(proxyid, T0);
    }

    let manager = manager(&store, &dc);
    manager.bootstrap().await.unwrap();
    assert_eq!(manager.cache().lock().groups[&1].new_hostids.len(), 2_500);

    manager.tick(T0 + 1).await.unwrap();

    let db = store.db();
    assert_eq!(db.insert_batches, vec![1_000, 1_000, 500]);
    assert_eq!(db.host_proxy.len(), 2_500);
    assert_eq!(db.commits, 1);
    assert_eq!(db.revision_writes, 1);
    assert_eq!(db.ids_revision, Some(2_500));
    drop(db);

    assert_eq!(manager.cache().hpmap_revision(), 2_500);
    assert_eq!(dc.hpmap_publish_count(), 1);
    assert_eq!(dc.group_hpmap_revision(1), Some(2_500));

    // The placement is balanced over the online proxies.
    let state = manager.cache().lock();
    for proxyid in [10, 11, 12] {
        let hosts = state.proxies[&proxyid].hosts.len();
        assert!((833..=834).contains(&hosts), "unbalanced: {hosts}");
    }
}

#[tokio::test]
async fn transient_commit_failures_retry_until_success() {
    let store = MemStore::new();
    store.add_group(1, 60, 1);
    store.add_proxy(10, Some(1), "edge-a", T0);
    for hostid in [100, 101, 102] {
        store.add_host(hostid, 1);
    }

    let dc = Arc::new(ConfigCache::new());
    dc.publish_groups(&[(1, 60, 1)]);
    dc.set_proxy_lastaccess(10, T0);

    let manager = manager(&store, &dc);
    manager.bootstrap().await.unwrap();

    store.fail_commits.store(2, Ordering::SeqCst);
    manager.tick(T0 + 1).await.unwrap();

    {
        let db = store.db();
        assert_eq!(db.commits, 1);
        assert_eq!(db.insert_batches, vec![3]);
        assert_eq!(db.host_proxy.len(), 3);
        assert_eq!(db.ids_revision, Some(3));
    }
    assert_eq!(dc.hpmap_publish_count(), 1);
    assert_eq!(dc.group_hpmap_revision(1), Some(3));

    // A tick with nothing to do leaves the persisted state alone.
    manager.tick(T0 + 2).await.unwrap();
    let db = store.db();
    assert_eq!(db.commits, 1);
    assert_eq!(db.ids_revision, Some(3));
}

#[tokio::test]
async fn vanished_rows_are_dropped_from_insert_batches() {
    let store = MemStore::new();
    store.add_group(1, 60, 1);
    store.add_proxy(10, Some(1), "edge-a", T0);
    for hostid in [100, 101, 102] {
        store.add_host(hostid, 1);
    }

    let dc = Arc::new(ConfigCache::new());
    dc.publish_groups(&[(1, 60, 1)]);
    dc.set_proxy_lastaccess(10, T0);

    let manager = manager(&store, &dc);
    manager.bootstrap().await.unwrap();

    // Host 101 disappears between planning and the flush.
    store.db().hosts.remove(&101);
    manager.tick(T0 + 1).await.unwrap();

    let db = store.db();
    assert_eq!(db.host_proxy.len(), 2);
    assert!(db.host_proxy.contains_key(&100));
    assert!(db.host_proxy.contains_key(&102));
}
