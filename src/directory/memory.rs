//! In-Memory Directory Store
//!
//! Keeps the directory in a process-local map. Used by tests in place of a
//! real database; the fault flag simulates a store outage so agent
//! behavior under transient unavailability can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{liveness_cutoff, DirectoryEntry, DirectoryStore};
use crate::error::{Error, Result};

/// Process-local directory store
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<(String, i64), DirectoryEntry>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail, or restore normal operation
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Total row count, including stale rows
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::DirectoryUnavailable("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn upsert(&self, entry: &DirectoryEntry) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        entries.insert(
            (entry.node_id.clone(), entry.incarnation),
            entry.clone(),
        );
        Ok(())
    }

    async fn scan_live(&self, staleness_window: Duration) -> Result<Vec<DirectoryEntry>> {
        self.check_available()?;
        let cutoff = liveness_cutoff(staleness_window, Utc::now());
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|e| e.last_seen_at > cutoff)
            .cloned()
            .collect())
    }

    async fn delete_stale(&self, staleness_window: Duration) -> Result<u64> {
        self.check_available()?;
        let cutoff = liveness_cutoff(staleness_window, Utc::now());
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.last_seen_at > cutoff);
        Ok((before - entries.len()) as u64)
    }

    async fn delete_superseded(
        &self,
        node_id: &str,
        below_incarnation: i64,
        grace: Duration,
    ) -> Result<u64> {
        self.check_available()?;
        let cutoff = liveness_cutoff(grace, Utc::now());
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(id, incarnation), e| {
            !(id == node_id && *incarnation < below_incarnation && e.last_seen_at <= cutoff)
        });
        Ok((before - entries.len()) as u64)
    }

    async fn remove(&self, node_id: &str, incarnation: i64) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        entries.remove(&(node_id.to_string(), incarnation));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aged(entry: DirectoryEntry, seconds: i64) -> DirectoryEntry {
        DirectoryEntry {
            last_seen_at: Utc::now() - chrono::Duration::seconds(seconds),
            ..entry
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let entry = DirectoryEntry::new("node-a", 1, "10.0.0.1", 7800);

        store.upsert(&entry).await.unwrap();
        store.upsert(&entry).await.unwrap();

        assert_eq!(store.len().await, 1);
        let live = store.scan_live(Duration::from_secs(30)).await.unwrap();
        assert_eq!(live, vec![entry]);
    }

    #[tokio::test]
    async fn test_stale_entries_excluded_and_deleted() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(30);

        let live = DirectoryEntry::new("node-a", 1, "10.0.0.1", 7800);
        let stale = aged(DirectoryEntry::new("node-b", 1, "10.0.0.2", 7800), 60);
        store.upsert(&live).await.unwrap();
        store.upsert(&stale).await.unwrap();

        let scanned = store.scan_live(window).await.unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].node_id, "node-a");

        let removed = store.delete_stale(window).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 1);

        // Deleting already-deleted rows is a no-op, not an error
        let removed = store.delete_stale(window).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_delete_superseded_respects_grace() {
        let store = MemoryStore::new();
        let grace = Duration::from_secs(10);

        let old = aged(DirectoryEntry::new("node-a", 1, "10.0.0.1", 7800), 60);
        let recent = DirectoryEntry::new("node-a", 2, "10.0.0.9", 7800);
        store.upsert(&old).await.unwrap();
        store.upsert(&recent).await.unwrap();

        // Incarnation 1 is past the grace period: pruned
        let removed = store.delete_superseded("node-a", 2, grace).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 1);

        // A fresh superseded row is still within grace: kept
        let fresh_old = DirectoryEntry::new("node-a", 1, "10.0.0.1", 7800);
        store.upsert(&fresh_old).await.unwrap();
        let removed = store.delete_superseded("node-a", 2, grace).await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_fault_flag_simulates_outage() {
        let store = MemoryStore::new();
        let entry = DirectoryEntry::new("node-a", 1, "10.0.0.1", 7800);

        store.set_failing(true);
        let err = store.upsert(&entry).await.unwrap_err();
        assert!(err.is_retryable());

        store.set_failing(false);
        store.upsert(&entry).await.unwrap();
        assert_eq!(store.len().await, 1);
    }
}
