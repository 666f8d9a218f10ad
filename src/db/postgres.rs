//! Postgres implementation of the storage boundary.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};

use crate::cache::{GroupStatus, HostMapping};
use crate::db::{GroupConfigRow, HostGroupRow, ProxyRow, Store, StoreTx};
use crate::error::Result;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_ids(values: &[u64]) -> Vec<i64> {
    values.iter().map(|&v| v as i64).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn begin<'a>(&'a self) -> Result<Box<dyn StoreTx + 'a>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn hpmap_revision(&self) -> Result<u64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT nextid FROM ids WHERE table_name = 'host_proxy' AND field_name = 'revision'",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(nextid,)| nextid as u64).unwrap_or(0))
    }

    async fn host_groups(&self) -> Result<Vec<HostGroupRow>> {
        let rows: Vec<(i64, i64)> =
            sqlx::query_as("SELECT hostid, proxy_groupid FROM hosts WHERE proxy_groupid IS NOT NULL")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(hostid, group_id)| HostGroupRow {
                hostid: hostid as u64,
                group_id: group_id as u64,
            })
            .collect())
    }

    async fn proxies(&self) -> Result<Vec<ProxyRow>> {
        let rows: Vec<(i64, i64, i64, String)> = sqlx::query_as(
            "SELECT p.proxyid, p.proxy_groupid, rt.lastaccess, p.name \
             FROM proxy p JOIN proxy_rtdata rt ON rt.proxyid = p.proxyid \
             WHERE p.proxy_groupid IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(proxyid, group_id, lastaccess, name)| ProxyRow {
                proxyid: proxyid as u64,
                group_id: group_id as u64,
                lastaccess: lastaccess.max(0) as u64,
                name,
            })
            .collect())
    }

    async fn host_mappings(&self) -> Result<Vec<HostMapping>> {
        let rows: Vec<(i64, i64, i64)> =
            sqlx::query_as("SELECT hostid, proxyid, revision FROM host_proxy")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(hostid, proxyid, revision)| HostMapping {
                hostid: hostid as u64,
                proxyid: proxyid as u64,
                revision: revision as u64,
            })
            .collect())
    }

    async fn proxy_names(&self, proxyids: &[u64]) -> Result<Vec<(u64, String)>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT proxyid, name FROM proxy WHERE proxyid = ANY($1) ORDER BY proxyid")
                .bind(to_ids(proxyids))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(proxyid, name)| (proxyid as u64, name))
            .collect())
    }

    async fn proxy_group_configs(&self) -> Result<Vec<GroupConfigRow>> {
        let rows: Vec<(i64, i64, i32)> =
            sqlx::query_as("SELECT proxy_groupid, failover_delay, min_online FROM proxy_group")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(group_id, failover_delay, min_online)| GroupConfigRow {
                group_id: group_id as u64,
                failover_delay: failover_delay.max(0) as u64,
                min_online: min_online.max(0) as u32,
            })
            .collect())
    }

    async fn proxy_lastaccess(&self) -> Result<Vec<(u64, u64)>> {
        let rows: Vec<(i64, i64)> =
            sqlx::query_as("SELECT proxyid, lastaccess FROM proxy_rtdata")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(proxyid, lastaccess)| (proxyid as u64, lastaccess.max(0) as u64))
            .collect())
    }
}

struct PgStoreTx<'a> {
    tx: Transaction<'a, Postgres>,
}

impl PgStoreTx<'_> {
    async fn lock_ids(&mut self, table: &str, field: &str, ids: &[u64]) -> Result<HashSet<u64>> {
        let mut sorted = to_ids(ids);
        sorted.sort_unstable();
        sorted.dedup();

        let sql = format!("SELECT {field} FROM {table} WHERE {field} = ANY($1) FOR UPDATE");
        let rows = sqlx::query(&sql)
            .bind(sorted)
            .fetch_all(&mut *self.tx)
            .await?;

        let mut existing = HashSet::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get(0)?;
            existing.insert(id as u64);
        }
        Ok(existing)
    }
}

#[async_trait]
impl StoreTx for PgStoreTx<'_> {
    async fn update_group_status(&mut self, group_id: u64, status: GroupStatus) -> Result<()> {
        sqlx::query("UPDATE proxy_group SET status = $1 WHERE proxy_groupid = $2")
            .bind(status.as_db())
            .bind(group_id as i64)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn update_host_mapping(&mut self, mapping: &HostMapping) -> Result<()> {
        sqlx::query("UPDATE host_proxy SET proxyid = $1, revision = $2 WHERE hostid = $3")
            .bind(mapping.proxyid as i64)
            .bind(mapping.revision as i64)
            .bind(mapping.hostid as i64)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_host_mappings(&mut self, hostids: &[u64]) -> Result<()> {
        sqlx::query("DELETE FROM host_proxy WHERE hostid = ANY($1)")
            .bind(to_ids(hostids))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn lock_host_ids(&mut self, hostids: &[u64]) -> Result<HashSet<u64>> {
        self.lock_ids("hosts", "hostid", hostids).await
    }

    async fn lock_proxy_ids(&mut self, proxyids: &[u64]) -> Result<HashSet<u64>> {
        self.lock_ids("proxy", "proxyid", proxyids).await
    }

    async fn insert_host_mappings(&mut self, mappings: &[HostMapping]) -> Result<()> {
        if mappings.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO host_proxy (hostid, proxyid, revision) ");
        builder.push_values(mappings, |mut row, mapping| {
            row.push_bind(mapping.hostid as i64)
                .push_bind(mapping.proxyid as i64)
                .push_bind(mapping.revision as i64);
        });
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn upsert_hpmap_revision(&mut self, revision: u64) -> Result<()> {
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT nextid FROM ids \
             WHERE table_name = 'host_proxy' AND field_name = 'revision' FOR UPDATE",
        )
        .fetch_optional(&mut *self.tx)
        .await?;

        if existing.is_some() {
            sqlx::query(
                "UPDATE ids SET nextid = $1 \
                 WHERE table_name = 'host_proxy' AND field_name = 'revision'",
            )
            .bind(revision as i64)
            .execute(&mut *self.tx)
            .await?;
        } else {
            sqlx::query("INSERT INTO ids (table_name, field_name, nextid) VALUES ('host_proxy', 'revision', $1)")
                .bind(revision as i64)
                .execute(&mut *self.tx)
                .await?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
