//! In-memory proxy group cache.
//!
//! The cache is the authoritative runtime state shared between the update
//! loop and the IPC service: proxy groups, proxies, the host→proxy map and
//! the pending update queues. A single coarse mutex guards everything;
//! critical sections are short and never span database I/O.

use std::collections::{HashMap, HashSet};
use std::fmt;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use tracing::{error, trace};

use crate::error::PgmError;
use crate::planner;

/// Proxy health as derived from heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyStatus {
    Unknown,
    Offline,
    Online,
}

/// Proxy group health state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupStatus {
    Unknown,
    Online,
    Offline,
    Recovery,
    Decay,
}

impl GroupStatus {
    /// Integer encoding persisted in `proxy_group.status`.
    pub fn as_db(self) -> i16 {
        match self {
            GroupStatus::Unknown => 0,
            GroupStatus::Online => 1,
            GroupStatus::Offline => 2,
            GroupStatus::Recovery => 3,
            GroupStatus::Decay => 4,
        }
    }

    pub fn from_db(value: i16) -> Self {
        match value {
            1 => GroupStatus::Online,
            2 => GroupStatus::Offline,
            3 => GroupStatus::Recovery,
            4 => GroupStatus::Decay,
            _ => GroupStatus::Unknown,
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupStatus::Unknown => write!(f, "UNKNOWN"),
            GroupStatus::Online => write!(f, "ONLINE"),
            GroupStatus::Offline => write!(f, "OFFLINE"),
            GroupStatus::Recovery => write!(f, "RECOVERY"),
            GroupStatus::Decay => write!(f, "DECAY"),
        }
    }
}

bitflags! {
    /// Pending persistence work for a group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GroupFlags: u32 {
        const UPDATE_STATUS = 0x01;
        const UPDATE_HP_MAP = 0x02;
    }
}

/// A proxy group: a set of proxies collectively monitoring a set of hosts.
#[derive(Debug)]
pub struct Group {
    pub group_id: u64,
    /// Heartbeat window in seconds before a proxy flips offline (and,
    /// symmetrically, the observation window before it flips online).
    pub failover_delay: u64,
    /// Quorum of online proxies required for the group to stay healthy.
    pub min_online: u32,
    /// Refreshed on every pull from the configuration cache; zero means the
    /// group was removed upstream.
    pub sync_revision: u64,
    /// Bumped upstream whenever the group configuration changes.
    pub revision: u64,
    pub status: GroupStatus,
    /// Epoch seconds of the last status transition.
    pub status_time: u64,
    /// Proxy ids attached to this group, in attach order.
    pub proxies: Vec<u64>,
    /// All hosts assigned to this group upstream.
    pub hostids: Vec<u64>,
    /// Hosts awaiting proxy placement.
    pub new_hostids: Vec<u64>,
    pub flags: GroupFlags,
}

impl Group {
    pub fn new(group_id: u64, failover_delay: u64, min_online: u32) -> Self {
        Self {
            group_id,
            failover_delay,
            min_online,
            sync_revision: 0,
            revision: 0,
            status: GroupStatus::Unknown,
            status_time: 0,
            proxies: Vec::new(),
            hostids: Vec::new(),
            new_hostids: Vec::new(),
            flags: GroupFlags::empty(),
        }
    }
}

/// A proxy worker polling hosts on behalf of its group.
#[derive(Debug)]
pub struct Proxy {
    pub proxy_id: u64,
    pub name: String,
    /// Owning group id; groups are looked up by id, never by pointer.
    pub group_id: u64,
    /// Epoch seconds of the most recent heartbeat.
    pub lastaccess: u64,
    /// First heartbeat since the proxy became eligible to go online;
    /// zero means not counting.
    pub firstaccess: u64,
    pub status: ProxyStatus,
    /// Hosts currently mapped to this proxy.
    pub hosts: Vec<u64>,
}

/// A row of the authoritative host→proxy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostMapping {
    pub hostid: u64,
    pub proxyid: u64,
    pub revision: u64,
}

/// A proxy move event: `srcid == 0` means insert, `dstid == 0` means delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyRelocation {
    pub proxyid: u64,
    pub srcid: u64,
    pub dstid: u64,
}

/// Snapshot of one group taken while draining the update queue.
#[derive(Debug, Clone, Copy)]
pub struct GroupUpdate {
    pub group_id: u64,
    pub status: GroupStatus,
    pub flags: GroupFlags,
}

/// Caller-owned snapshot of everything pending persistence. After
/// [`CacheState::take_updates`] returns, the cache's pending sets are empty.
#[derive(Debug, Default)]
pub struct PendingUpdates {
    pub groups: Vec<GroupUpdate>,
    pub hosts_new: Vec<HostMapping>,
    pub hosts_mod: Vec<HostMapping>,
    pub hosts_del: Vec<HostMapping>,
    pub hpmap_revision: u64,
}

impl PendingUpdates {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
            && self.hosts_new.is_empty()
            && self.hosts_mod.is_empty()
            && self.hosts_del.is_empty()
    }
}

/// Diagnostic counters served over IPC.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub groups: u64,
    pub proxies: u64,
    pub host_mappings: u64,
    pub queued_updates: u64,
    pub hpmap_revision: u64,
}

/// Everything behind the cache mutex.
#[derive(Debug, Default)]
pub struct CacheState {
    pub groups: HashMap<u64, Group>,
    pub proxies: HashMap<u64, Proxy>,
    pub hpmap: HashMap<u64, HostMapping>,
    /// Groups needing re-evaluation or persistence, in queue order.
    pub group_updates: Vec<u64>,
    queued_groups: HashSet<u64>,
    /// Relocation events in arrival order; order and multiplicity matter
    /// (an insert followed by a delete of the same proxy must both apply).
    pub relocated_proxies: Vec<ProxyRelocation>,
    pub hosts_new: Vec<HostMapping>,
    pub hosts_mod: Vec<HostMapping>,
    pub hosts_del: Vec<HostMapping>,
    /// Monotonic revision equal to the highest mapping revision handed out.
    pub hpmap_revision: u64,
    /// Last revision observed from the configuration cache.
    pub group_revision: u64,
    /// Epoch seconds of process start; suppresses false OFFLINE calls
    /// before the first full failover window has passed.
    pub startup_time: u64,
}

impl CacheState {
    /// Creates a proxy attached to `group_id`, or reattaches an existing
    /// one. `firstaccess` carries the persisted lastaccess during bootstrap
    /// until the initial classification clears it.
    pub fn add_proxy(&mut self, group_id: u64, proxy_id: u64, name: &str, firstaccess: u64) {
        if let Some(group) = self.groups.get_mut(&group_id) {
            if !group.proxies.contains(&proxy_id) {
                group.proxies.push(proxy_id);
            }
        }

        self.proxies
            .entry(proxy_id)
            .and_modify(|proxy| proxy.group_id = group_id)
            .or_insert_with(|| Proxy {
                proxy_id,
                name: name.to_owned(),
                group_id,
                lastaccess: 0,
                firstaccess,
                status: ProxyStatus::Unknown,
                hosts: Vec::new(),
            });
    }

    /// Detaches a proxy from its group without releasing it. Returns the
    /// orphaned proxy id; the caller reattaches or frees it.
    pub fn remove_proxy(&mut self, group_id: u64, proxy_id: u64) -> Option<u64> {
        let group = self.groups.get_mut(&group_id)?;
        let pos = group.proxies.iter().position(|&id| id == proxy_id)?;
        group.proxies.remove(pos);
        Some(proxy_id)
    }

    /// Releases a proxy. Its hosts flow back into the owning group's
    /// `new_hostids` for replanning and their mappings are queued for
    /// deletion.
    pub fn free_proxy(&mut self, proxy_id: u64) {
        let Some(proxy) = self.proxies.remove(&proxy_id) else {
            return;
        };
        let group_id = proxy.group_id;

        for &hostid in &proxy.hosts {
            self.set_host_proxy(hostid, 0);
        }

        if let Some(group) = self.groups.get_mut(&group_id) {
            group.proxies.retain(|&id| id != proxy_id);
            group.new_hostids.extend(proxy.hosts.iter().copied());
        }
        self.queue_group_update(group_id);
    }

    /// Atomically updates the host→proxy map. `proxyid == 0` removes the
    /// mapping and enqueues a delete; otherwise the mapping is created or
    /// reassigned with a freshly bumped revision and the owning group is
    /// marked for a host-proxy map flush.
    pub fn set_host_proxy(&mut self, hostid: u64, proxyid: u64) {
        if proxyid == 0 {
            let mapping = match self.hpmap.remove(&hostid) {
                Some(mapping) => {
                    if let Some(old) = self.proxies.get_mut(&mapping.proxyid) {
                        old.hosts.retain(|&id| id != hostid);
                    }
                    mapping
                }
                // A database row with no cache entry still needs deleting.
                None => HostMapping {
                    hostid,
                    proxyid: 0,
                    revision: 0,
                },
            };
            self.hpmap_revision += 1;
            self.hosts_del.push(mapping);
            return;
        }

        if let Some(current) = self.hpmap.get(&hostid).copied() {
            if current.proxyid == proxyid {
                return;
            }
            if let Some(old) = self.proxies.get_mut(&current.proxyid) {
                old.hosts.retain(|&id| id != hostid);
            }
            self.hpmap_revision += 1;
            let mapping = HostMapping {
                hostid,
                proxyid,
                revision: self.hpmap_revision,
            };
            self.hpmap.insert(hostid, mapping);
            self.attach_mapping(mapping);
            self.hosts_mod.push(mapping);
        } else {
            self.hpmap_revision += 1;
            let mapping = HostMapping {
                hostid,
                proxyid,
                revision: self.hpmap_revision,
            };
            self.hpmap.insert(hostid, mapping);
            self.attach_mapping(mapping);
            self.hosts_new.push(mapping);
        }
    }

    fn attach_mapping(&mut self, mapping: HostMapping) {
        let group_id = match self.proxies.get_mut(&mapping.proxyid) {
            Some(proxy) => {
                proxy.hosts.push(mapping.hostid);
                proxy.group_id
            }
            None => {
                let err = PgmError::CacheInconsistent(format!(
                    "host {} mapped to unknown proxy {}",
                    mapping.hostid, mapping.proxyid
                ));
                error!(error = %err, "skipping host mapping");
                return;
            }
        };

        if let Some(group) = self.groups.get_mut(&group_id) {
            group.flags |= GroupFlags::UPDATE_HP_MAP;
        }
        self.queue_group_update(group_id);
    }

    /// Idempotent append to the group update queue.
    pub fn queue_group_update(&mut self, group_id: u64) {
        if !self.groups.contains_key(&group_id) {
            return;
        }
        if self.queued_groups.insert(group_id) {
            self.group_updates.push(group_id);
        }
    }

    pub fn has_group_updates(&self) -> bool {
        !self.group_updates.is_empty()
    }

    /// Drains the update queue and pending host-mapping deltas into a
    /// caller-owned snapshot. Unplaced hosts of each queued group are
    /// assigned to online proxies first, so the snapshot already carries
    /// the resulting inserts.
    pub fn take_updates(&mut self) -> PendingUpdates {
        let mut ids = std::mem::take(&mut self.group_updates);
        self.queued_groups.clear();

        for i in 0..ids.len() {
            planner::assign_new_hosts(self, ids[i]);
        }

        // Planning re-queues the groups it touched; fold those back in.
        for group_id in std::mem::take(&mut self.group_updates) {
            if !ids.contains(&group_id) {
                ids.push(group_id);
            }
        }
        self.queued_groups.clear();

        let mut groups = Vec::with_capacity(ids.len());
        for group_id in ids {
            if let Some(group) = self.groups.get_mut(&group_id) {
                groups.push(GroupUpdate {
                    group_id,
                    status: group.status,
                    flags: group.flags,
                });
                group.flags = GroupFlags::empty();
            }
        }

        PendingUpdates {
            groups,
            hosts_new: std::mem::take(&mut self.hosts_new),
            hosts_mod: std::mem::take(&mut self.hosts_mod),
            hosts_del: std::mem::take(&mut self.hosts_del),
            hpmap_revision: self.hpmap_revision,
        }
    }

    /// Puts a drained snapshot back so the next tick retries from the same
    /// queued state. Used when a flush fails permanently.
    pub fn requeue_updates(&mut self, updates: PendingUpdates) {
        for update in updates.groups {
            if let Some(group) = self.groups.get_mut(&update.group_id) {
                group.flags |= update.flags;
            } else {
                continue;
            }
            self.queue_group_update(update.group_id);
        }

        let mut hosts_new = updates.hosts_new;
        hosts_new.append(&mut self.hosts_new);
        self.hosts_new = hosts_new;

        let mut hosts_mod = updates.hosts_mod;
        hosts_mod.append(&mut self.hosts_mod);
        self.hosts_mod = hosts_mod;

        let mut hosts_del = updates.hosts_del;
        hosts_del.append(&mut self.hosts_del);
        self.hosts_del = hosts_del;
    }

    /// Removes a group together with its proxies; host mappings owned by
    /// those proxies are queued for deletion first.
    pub fn remove_group(&mut self, group_id: u64) {
        let Some(group) = self.groups.remove(&group_id) else {
            return;
        };

        for proxy_id in group.proxies {
            if let Some(proxy) = self.proxies.remove(&proxy_id) {
                for hostid in proxy.hosts {
                    self.set_host_proxy(hostid, 0);
                }
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            groups: self.groups.len() as u64,
            proxies: self.proxies.len() as u64,
            host_mappings: self.hpmap.len() as u64,
            queued_updates: self.group_updates.len() as u64,
            hpmap_revision: self.hpmap_revision,
        }
    }

    /// Trace-level dump of the cache, emitted after a flush that wrote
    /// anything.
    pub fn trace_dump(&self) {
        trace!(
            groups = self.groups.len(),
            proxies = self.proxies.len(),
            host_mappings = self.hpmap.len(),
            hpmap_revision = self.hpmap_revision,
            group_revision = self.group_revision,
            "cache state"
        );
        for group in self.groups.values() {
            trace!(
                group_id = group.group_id,
                status = %group.status,
                status_time = group.status_time,
                proxies = group.proxies.len(),
                hosts = group.hostids.len(),
                unplaced = group.new_hostids.len(),
                "group"
            );
        }
        for proxy in self.proxies.values() {
            trace!(
                proxy_id = proxy.proxy_id,
                name = %proxy.name,
                group_id = proxy.group_id,
                status = ?proxy.status,
                lastaccess = proxy.lastaccess,
                hosts = proxy.hosts.len(),
                "proxy"
            );
        }
    }
}

/// Thread-safe cache handle shared by the update loop and the IPC service.
#[derive(Debug)]
pub struct PgCache {
    state: Mutex<CacheState>,
}

impl PgCache {
    pub fn new(startup_time: u64) -> Self {
        let state = CacheState {
            startup_time,
            ..CacheState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock()
    }

    /// Queues a proxy relocation event; called from the IPC service.
    pub fn queue_relocation(&self, event: ProxyRelocation) {
        self.lock().relocated_proxies.push(event);
    }

    pub fn has_relocations(&self) -> bool {
        !self.lock().relocated_proxies.is_empty()
    }

    pub fn has_group_updates(&self) -> bool {
        self.lock().has_group_updates()
    }

    pub fn host_proxy(&self, hostid: u64) -> Option<HostMapping> {
        self.lock().hpmap.get(&hostid).copied()
    }

    pub fn group_status(&self, group_id: u64) -> Option<(GroupStatus, u64)> {
        let state = self.lock();
        let group = state.groups.get(&group_id)?;
        Some((group.status, group.status_time))
    }

    pub fn hpmap_revision(&self) -> u64 {
        self.lock().hpmap_revision
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats()
    }
}
