//! Storage boundary: the read/write contract the reconciliation core has
//! with the database, expressed as traits so the flush and bootstrap logic
//! runs unchanged against the production Postgres backend or a test double.

mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::cache::{GroupStatus, HostMapping};
use crate::error::Result;

pub use postgres::PgStore;

/// A `hosts` row with an upstream group assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostGroupRow {
    pub hostid: u64,
    pub group_id: u64,
}

/// A `proxy` row joined with its runtime data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRow {
    pub proxyid: u64,
    pub group_id: u64,
    pub lastaccess: u64,
    pub name: String,
}

/// A `proxy_group` configuration row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupConfigRow {
    pub group_id: u64,
    pub failover_delay: u64,
    pub min_online: u32,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Opens a transaction for a flush.
    async fn begin<'a>(&'a self) -> Result<Box<dyn StoreTx + 'a>>;

    /// Persisted host-mapping revision; zero when the row is missing.
    async fn hpmap_revision(&self) -> Result<u64>;

    /// Hosts with an assigned proxy group.
    async fn host_groups(&self) -> Result<Vec<HostGroupRow>>;

    /// Proxies belonging to a group, with their last heartbeat.
    async fn proxies(&self) -> Result<Vec<ProxyRow>>;

    /// The full host→proxy table.
    async fn host_mappings(&self) -> Result<Vec<HostMapping>>;

    /// Names for the given proxy ids; unknown ids are omitted.
    async fn proxy_names(&self, proxyids: &[u64]) -> Result<Vec<(u64, String)>>;

    /// Proxy group definitions, for the configuration cache producer.
    async fn proxy_group_configs(&self) -> Result<Vec<GroupConfigRow>>;

    /// Last heartbeat of every proxy, for the configuration cache producer.
    async fn proxy_lastaccess(&self) -> Result<Vec<(u64, u64)>>;
}

#[async_trait]
pub trait StoreTx: Send {
    async fn update_group_status(&mut self, group_id: u64, status: GroupStatus) -> Result<()>;

    async fn update_host_mapping(&mut self, mapping: &HostMapping) -> Result<()>;

    /// Single batched delete by host id.
    async fn delete_host_mappings(&mut self, hostids: &[u64]) -> Result<()>;

    /// Locks the listed host rows and returns the ids that still exist.
    async fn lock_host_ids(&mut self, hostids: &[u64]) -> Result<HashSet<u64>>;

    /// Locks the listed proxy rows and returns the ids that still exist.
    async fn lock_proxy_ids(&mut self, proxyids: &[u64]) -> Result<HashSet<u64>>;

    async fn insert_host_mappings(&mut self, mappings: &[HostMapping]) -> Result<()>;

    /// Persists the host-mapping revision into the ids table, inserting the
    /// row when it does not exist yet.
    async fn upsert_hpmap_revision(&mut self, revision: u64) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
