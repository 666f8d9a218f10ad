//! Transactional flush of pending group and host-mapping updates.

use tracing::{debug, enabled, warn, Level};

use crate::cache::{GroupFlags, HostMapping, PendingUpdates, PgCache};
use crate::db::{Store, StoreTx};
use crate::dc::ConfigCache;
use crate::error::Result;

/// New host mappings are inserted in batches of this size; each batch locks
/// and verifies its host and proxy ids first.
pub const INSERT_BATCH_SIZE: usize = 1000;

/// Drains the cache's pending updates and persists them. Transient database
/// unavailability retries the whole transaction body; on a permanent error
/// the snapshot is re-queued so the next tick retries from the same state.
/// The host-mapping revision is published to the configuration cache only
/// after a successful commit.
pub async fn flush_updates(cache: &PgCache, store: &dyn Store, dc: &ConfigCache) -> Result<()> {
    let updates = cache.lock().take_updates();
    if updates.is_empty() {
        return Ok(());
    }

    debug!(
        groups = updates.groups.len(),
        inserts = updates.hosts_new.len(),
        updates = updates.hosts_mod.len(),
        deletes = updates.hosts_del.len(),
        revision = updates.hpmap_revision,
        "flushing proxy group updates"
    );

    loop {
        match flush_once(store, &updates).await {
            Ok(()) => break,
            Err(err) if err.is_transient() => {
                warn!("database is down, retrying flush");
                continue;
            }
            Err(err) => {
                cache.lock().requeue_updates(updates);
                return Err(err);
            }
        }
    }

    let groupids: Vec<u64> = updates
        .groups
        .iter()
        .filter(|group| group.flags.contains(GroupFlags::UPDATE_HP_MAP))
        .map(|group| group.group_id)
        .collect();
    if !groupids.is_empty() {
        dc.update_group_hpmap_revision(&groupids, updates.hpmap_revision);
    }

    if enabled!(Level::TRACE) {
        cache.lock().trace_dump();
    }

    Ok(())
}

async fn flush_once(store: &dyn Store, updates: &PendingUpdates) -> Result<()> {
    let mut tx = store.begin().await?;

    for group in &updates.groups {
        if group.flags.contains(GroupFlags::UPDATE_STATUS) {
            tx.update_group_status(group.group_id, group.status).await?;
        }
    }

    for mapping in &updates.hosts_mod {
        tx.update_host_mapping(mapping).await?;
    }

    if !updates.hosts_del.is_empty() {
        let mut hostids: Vec<u64> = updates.hosts_del.iter().map(|m| m.hostid).collect();
        hostids.sort_unstable();
        hostids.dedup();
        tx.delete_host_mappings(&hostids).await?;
    }

    for batch in updates.hosts_new.chunks(INSERT_BATCH_SIZE) {
        insert_batch(tx.as_mut(), batch).await?;
    }

    tx.upsert_hpmap_revision(updates.hpmap_revision).await?;

    tx.commit().await
}

/// Inserts one batch, pre-locking the referenced host and proxy rows and
/// silently dropping mappings whose host or proxy vanished underneath us.
async fn insert_batch(tx: &mut dyn StoreTx, batch: &[HostMapping]) -> Result<()> {
    let hostids: Vec<u64> = batch.iter().map(|m| m.hostid).collect();
    let proxyids: Vec<u64> = batch.iter().map(|m| m.proxyid).collect();

    let hosts = tx.lock_host_ids(&hostids).await?;
    let proxies = tx.lock_proxy_ids(&proxyids).await?;

    let rows: Vec<HostMapping> = batch
        .iter()
        .filter(|m| hosts.contains(&m.hostid) && proxies.contains(&m.proxyid))
        .copied()
        .collect();

    if rows.len() < batch.len() {
        debug!(
            dropped = batch.len() - rows.len(),
            "skipping host mappings whose host or proxy no longer exists"
        );
    }

    tx.insert_host_mappings(&rows).await
}
