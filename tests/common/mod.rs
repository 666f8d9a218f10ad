//! In-memory storage double used by the integration scenarios.

use std::collections::HashSet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};

use pgroupd::cache::{GroupStatus, HostMapping};
use pgroupd::db::{GroupConfigRow, HostGroupRow, ProxyRow, Store, StoreTx};
use pgroupd::error::{PgmError, Result};

#[derive(Debug, Default)]
pub struct MemDb {
    /// hostid → proxy group id.
    pub hosts: HashMap<u64, u64>,
    /// proxyid → (group id if assigned, name).
    pub proxies: HashMap<u64, (Option<u64>, String)>,
    /// proxyid → lastaccess.
    pub rtdata: HashMap<u64, u64>,
    /// group id → (failover_delay, min_online, status).
    pub groups: HashMap<u64, (u64, u32, i16)>,
    /// hostid → (proxyid, revision).
    pub host_proxy: HashMap<u64, (u64, u64)>,
    pub ids_revision: Option<u64>,
    /// Successful commits.
    pub commits: usize,
    /// Revision upserts applied.
    pub revision_writes: usize,
    /// Sizes of the insert statements applied, in order.
    pub insert_batches: Vec<usize>,
}

/// A [`Store`] whose transactions buffer their writes and apply them
/// atomically at commit. `fail_commits` makes the next N commits report
/// the database as down.
#[derive(Debug, Default)]
pub struct MemStore {
    db: Mutex<MemDb>,
    pub fail_commits: AtomicUsize,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn db(&self) -> MutexGuard<'_, MemDb> {
        self.db.lock()
    }

    pub fn add_group(&self, group_id: u64, failover_delay: u64, min_online: u32) {
        self.db().groups.insert(group_id, (failover_delay, min_online, 0));
    }

    pub fn add_proxy(&self, proxyid: u64, group_id: Option<u64>, name: &str, lastaccess: u64) {
        let mut db = self.db();
        db.proxies.insert(proxyid, (group_id, name.to_owned()));
        db.rtdata.insert(proxyid, lastaccess);
    }

    pub fn add_host(&self, hostid: u64, group_id: u64) {
        self.db().hosts.insert(hostid, group_id);
    }
}

enum Op {
    GroupStatus(u64, GroupStatus),
    UpdateMapping(HostMapping),
    Delete(Vec<u64>),
    Insert(Vec<HostMapping>),
    Revision(u64),
}

pub struct MemTx<'a> {
    store: &'a MemStore,
    ops: Vec<Op>,
}

#[async_trait]
impl Store for MemStore {
    async fn begin<'a>(&'a self) -> Result<Box<dyn StoreTx + 'a>> {
        Ok(Box::new(MemTx {
            store: self,
            ops: Vec::new(),
        }))
    }

    async fn hpmap_revision(&self) -> Result<u64> {
        Ok(self.db().ids_revision.unwrap_or(0))
    }

    async fn host_groups(&self) -> Result<Vec<HostGroupRow>> {
        Ok(self
            .db()
            .hosts
            .iter()
            .map(|(&hostid, &group_id)| HostGroupRow { hostid, group_id })
            .collect())
    }

    async fn proxies(&self) -> Result<Vec<ProxyRow>> {
        let db = self.db();
        Ok(db
            .proxies
            .iter()
            .filter_map(|(&proxyid, (group_id, name))| {
                group_id.map(|group_id| ProxyRow {
                    proxyid,
                    group_id,
                    lastaccess: db.rtdata.get(&proxyid).copied().unwrap_or(0),
                    name: name.clone(),
                })
            })
            .collect())
    }

    async fn host_mappings(&self) -> Result<Vec<HostMapping>> {
        Ok(self
            .db()
            .host_proxy
            .iter()
            .map(|(&hostid, &(proxyid, revision))| HostMapping {
                hostid,
                proxyid,
                revision,
            })
            .collect())
    }

    async fn proxy_names(&self, proxyids: &[u64]) -> Result<Vec<(u64, String)>> {
        let db = self.db();
        let mut names: Vec<(u64, String)> = proxyids
            .iter()
            .filter_map(|id| db.proxies.get(id).map(|(_, name)| (*id, name.clone())))
            .collect();
        names.sort_unstable_by_key(|&(id, _)| id);
        Ok(names)
    }

    async fn proxy_group_configs(&self) -> Result<Vec<GroupConfigRow>> {
        Ok(self
            .db()
            .groups
            .iter()
            .map(|(&group_id, &(failover_delay, min_online, _))| GroupConfigRow {
                group_id,
                failover_delay,
                min_online,
            })
            .collect())
    }

    async fn proxy_lastaccess(&self) -> Result<Vec<(u64, u64)>> {
        Ok(self
            .db()
            .rtdata
            .iter()
            .map(|(&proxyid, &lastaccess)| (proxyid, lastaccess))
            .collect())
    }
}

#[async_trait]
impl StoreTx for MemTx<'_> {
    async fn update_group_status(&mut self, group_id: u64, status: GroupStatus) -> Result<()> {
        self.ops.push(Op::GroupStatus(group_id, status));
        Ok(())
    }

    async fn update_host_mapping(&mut self, mapping: &HostMapping) -> Result<()> {
        self.ops.push(Op::UpdateMapping(*mapping));
        Ok(())
    }

    async fn delete_host_mappings(&mut self, hostids: &[u64]) -> Result<()> {
        self.ops.push(Op::Delete(hostids.to_vec()));
        Ok(())
    }

    async fn lock_host_ids(&mut self, hostids: &[u64]) -> Result<HashSet<u64>> {
        let db = self.store.db();
        Ok(hostids
            .iter()
            .copied()
            .filter(|id| db.hosts.contains_key(id))
            .collect())
    }

    async fn lock_proxy_ids(&mut self, proxyids: &[u64]) -> Result<HashSet<u64>> {
        let db = self.store.db();
        Ok(proxyids
            .iter()
            .copied()
            .filter(|id| db.proxies.contains_key(id))
            .collect())
    }

    async fn insert_host_mappings(&mut self, mappings: &[HostMapping]) -> Result<()> {
        self.ops.push(Op::Insert(mappings.to_vec()));
        Ok(())
    }

    async fn upsert_hpmap_revision(&mut self, revision: u64) -> Result<()> {
        self.ops.push(Op::Revision(revision));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.store.fail_commits.load(Ordering::SeqCst) > 0 {
            self.store.fail_commits.fetch_sub(1, Ordering::SeqCst);
            return Err(PgmError::DbUnavailable);
        }

        let mut db = self.store.db();
        for op in self.ops {
            match op {
                Op::GroupStatus(group_id, status) => {
                    if let Some(group) = db.groups.get_mut(&group_id) {
                        group.2 = status.as_db();
                    }
                }
                Op::UpdateMapping(mapping) => {
                    if let Some(row) = db.host_proxy.get_mut(&mapping.hostid) {
                        *row = (mapping.proxyid, mapping.revision);
                    }
                }
                Op::Delete(hostids) => {
                    for hostid in hostids {
                        db.host_proxy.remove(&hostid);
                    }
                }
                Op::Insert(mappings) => {
                    db.insert_batches.push(mappings.len());
                    for mapping in mappings {
                        db.host_proxy
                            .insert(mapping.hostid, (mapping.proxyid, mapping.revision));
                    }
                }
                Op::Revision(revision) => {
                    db.ids_revision = Some(revision);
                    db.revision_writes += 1;
                }
            }
        }
        db.commits += 1;
        Ok(())
    }
}
