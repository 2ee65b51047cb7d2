//! SQL Directory Store
//!
//! Backs the discovery directory with a MySQL/MariaDB table reachable by
//! every node. All writes are idempotent: upserts use
//! `INSERT ... ON DUPLICATE KEY UPDATE`, deletes are condition-checked on
//! `last_seen_at`, so concurrent passes from multiple nodes never conflict.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};

use super::{liveness_cutoff, DirectoryEntry, DirectoryStore};
use crate::config::DatabaseConfig;
use crate::error::Result;

/// Name of the rendezvous table
pub const ROSTER_TABLE: &str = "cluster_roster";

/// MySQL-backed directory store
pub struct SqlStore {
    pool: MySqlPool,
}

impl SqlStore {
    /// Open a lazy connection pool to the directory database.
    ///
    /// No connection is attempted here; a database that is down at boot
    /// shows up as retryable errors on the first operations instead of
    /// crashing the node.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let url = format!(
            "mysql://{}:{}@{}:{}/{}",
            config.user, config.password, config.host, config.port, config.database
        );

        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_lazy(&url)?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (used when the caller manages connections)
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Create the rendezvous table if it does not exist
    pub async fn ensure_schema(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {ROSTER_TABLE} (
                node_id      VARCHAR(128) NOT NULL,
                incarnation  BIGINT       NOT NULL,
                address      VARCHAR(255) NOT NULL,
                port         INT          NOT NULL,
                last_seen_at TIMESTAMP(3) NOT NULL,
                PRIMARY KEY (node_id, incarnation)
            )"
        );

        sqlx::query(&ddl).execute(&self.pool).await?;
        tracing::debug!("Directory schema ensured ({})", ROSTER_TABLE);
        Ok(())
    }

    /// Remove every row; operator reset
    pub async fn truncate(&self) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {ROSTER_TABLE}"))
            .execute(&self.pool)
            .await?;
        tracing::warn!("Directory truncated by operator request");
        Ok(())
    }
}

#[async_trait]
impl DirectoryStore for SqlStore {
    async fn upsert(&self, entry: &DirectoryEntry) -> Result<()> {
        let sql = format!(
            "INSERT INTO {ROSTER_TABLE} (node_id, incarnation, address, port, last_seen_at)
             VALUES (?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                 address = VALUES(address),
                 port = VALUES(port),
                 last_seen_at = VALUES(last_seen_at)"
        );

        sqlx::query(&sql)
            .bind(&entry.node_id)
            .bind(entry.incarnation)
            .bind(&entry.address)
            .bind(entry.port as i32)
            .bind(entry.last_seen_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn scan_live(&self, staleness_window: Duration) -> Result<Vec<DirectoryEntry>> {
        let cutoff = liveness_cutoff(staleness_window, Utc::now());
        let sql = format!(
            "SELECT node_id, incarnation, address, port, last_seen_at
             FROM {ROSTER_TABLE}
             WHERE last_seen_at > ?"
        );

        let rows = sqlx::query(&sql).bind(cutoff).fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| DirectoryEntry {
                node_id: row.get("node_id"),
                incarnation: row.get("incarnation"),
                address: row.get("address"),
                port: row.get::<i32, _>("port") as u16,
                last_seen_at: row.get("last_seen_at"),
            })
            .collect())
    }

    async fn delete_stale(&self, staleness_window: Duration) -> Result<u64> {
        let cutoff = liveness_cutoff(staleness_window, Utc::now());
        let sql = format!("DELETE FROM {ROSTER_TABLE} WHERE last_seen_at <= ?");

        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete_superseded(
        &self,
        node_id: &str,
        below_incarnation: i64,
        grace: Duration,
    ) -> Result<u64> {
        let cutoff = liveness_cutoff(grace, Utc::now());
        let sql = format!(
            "DELETE FROM {ROSTER_TABLE}
             WHERE node_id = ? AND incarnation < ? AND last_seen_at <= ?"
        );

        let result = sqlx::query(&sql)
            .bind(node_id)
            .bind(below_incarnation)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove(&self, node_id: &str, incarnation: i64) -> Result<()> {
        let sql = format!("DELETE FROM {ROSTER_TABLE} WHERE node_id = ? AND incarnation = ?");

        sqlx::query(&sql)
            .bind(node_id)
            .bind(incarnation)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
