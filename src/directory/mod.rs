//! Shared Discovery Directory
//!
//! The directory is a shared persistent table that nodes use as a
//! rendezvous point: each node publishes its own routable endpoint and
//! scans the table to discover peers. It is the only coordination channel
//! in the system; there is no peer-to-peer RPC.

mod memory;
mod sql;

pub use memory::MemoryStore;
pub use sql::SqlStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One directory row per cluster node incarnation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Stable logical identifier of the node
    pub node_id: String,
    /// Process-lifetime counter; bumped on every restart of the node
    pub incarnation: i64,
    /// Routable address peers should use
    pub address: String,
    /// Routable port peers should use
    pub port: u16,
    /// Timestamp of the last successful refresh
    pub last_seen_at: DateTime<Utc>,
}

impl DirectoryEntry {
    /// Create a new entry stamped with the current time
    pub fn new(node_id: impl Into<String>, incarnation: i64, address: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            incarnation,
            address: address.into(),
            port,
            last_seen_at: Utc::now(),
        }
    }

    /// The `address:port` endpoint of this entry
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Whether this entry counts as live at `now`
    pub fn is_live(&self, staleness_window: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_seen_at)
            < chrono::Duration::milliseconds(staleness_window.as_millis() as i64)
    }

    /// Copy of this entry with a fresh `last_seen_at`
    pub fn touched(&self) -> Self {
        Self {
            last_seen_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Persistent directory operations.
///
/// Rows are keyed by `(node_id, incarnation)`. Each node only ever upserts
/// its own key; deletes of other nodes' rows are condition-checked on age
/// and idempotent, so concurrent callers cannot conflict. Transient
/// unavailability surfaces as an error to the caller, which retries on its
/// own schedule; the store never retries internally.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Insert or update the row keyed by the entry's `(node_id, incarnation)`
    async fn upsert(&self, entry: &DirectoryEntry) -> Result<()>;

    /// All entries refreshed within the staleness window, any node, any incarnation
    async fn scan_live(&self, staleness_window: Duration) -> Result<Vec<DirectoryEntry>>;

    /// Delete entries older than the staleness window, returning the count removed
    async fn delete_stale(&self, staleness_window: Duration) -> Result<u64>;

    /// Delete superseded incarnations of a node that have not been
    /// refreshed within the grace period.
    ///
    /// The grace check protects a row the owner may be mid-way through
    /// re-registering.
    async fn delete_superseded(
        &self,
        node_id: &str,
        below_incarnation: i64,
        grace: Duration,
    ) -> Result<u64>;

    /// Delete one exact row; used for best-effort self-deregistration
    async fn remove(&self, node_id: &str, incarnation: i64) -> Result<()>;
}

/// Cutoff timestamp for liveness: rows seen at or after it are live
pub(crate) fn liveness_cutoff(window: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    now - chrono::Duration::milliseconds(window.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_liveness() {
        let mut entry = DirectoryEntry::new("node-a", 1, "10.0.0.1", 7800);
        let window = Duration::from_secs(30);

        assert!(entry.is_live(window, Utc::now()));

        entry.last_seen_at = Utc::now() - chrono::Duration::seconds(31);
        assert!(!entry.is_live(window, Utc::now()));
    }

    #[test]
    fn test_endpoint_format() {
        let entry = DirectoryEntry::new("node-a", 1, "10.0.0.1", 7800);
        assert_eq!(entry.endpoint(), "10.0.0.1:7800");
    }

    #[test]
    fn test_touched_bumps_timestamp() {
        let mut entry = DirectoryEntry::new("node-a", 1, "10.0.0.1", 7800);
        entry.last_seen_at = Utc::now() - chrono::Duration::seconds(60);

        let touched = entry.touched();
        assert!(touched.last_seen_at > entry.last_seen_at);
        assert_eq!(touched.node_id, entry.node_id);
        assert_eq!(touched.incarnation, entry.incarnation);
    }
}
