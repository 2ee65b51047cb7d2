//! View Merging and Reconciliation
//!
//! Turns a raw directory scan into a trustworthy peer list. Stale or
//! duplicate-incarnation rows are an expected steady-state condition, not
//! an error: a node that restarts leaves its previous incarnation behind
//! until some node's prune pass removes it. The merge keeps only the
//! highest incarnation per node and reports the rest as prune candidates.
//!
//! No leader election, no quorum: the directory is the single source of
//! truth and every node reconciles it independently. Views converge within
//! O(refresh period + staleness window) rather than immediately.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::directory::DirectoryEntry;

/// A node's current belief about which peers are live.
///
/// Rebuilt whole on every scan cycle, never mutated incrementally. Order
/// carries no meaning; entries are kept sorted by node id so equal views
/// compare equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalView {
    /// One live entry per node, highest incarnation
    pub entries: Vec<DirectoryEntry>,
    /// When this view was built
    pub built_at: Option<DateTime<Utc>>,
}

impl LocalView {
    /// The empty view, before the first successful scan
    pub fn empty() -> Self {
        Self::default()
    }

    /// Entry for a node id, if the view considers it live
    pub fn get(&self, node_id: &str) -> Option<&DirectoryEntry> {
        self.entries.iter().find(|e| e.node_id == node_id)
    }

    /// Whether the view contains exactly this node incarnation.
    ///
    /// A node considers itself joined once its own current incarnation
    /// shows up in the view it built.
    pub fn contains_incarnation(&self, node_id: &str, incarnation: i64) -> bool {
        self.get(node_id)
            .map(|e| e.incarnation == incarnation)
            .unwrap_or(false)
    }

    /// The peer endpoints handed to the application layer
    pub fn endpoints(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.endpoint()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of reconciling one directory scan
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The reconciled view
    pub view: LocalView,
    /// Superseded lower-incarnation rows, candidates for pruning once
    /// their grace period expires
    pub superseded: Vec<DirectoryEntry>,
}

/// Reconciles directory scans into LocalViews
pub struct ViewMerger;

impl ViewMerger {
    /// Merge a raw scan: group by node id, keep the highest incarnation
    /// per node, report the rest as superseded.
    pub fn merge(scanned: Vec<DirectoryEntry>) -> MergeOutcome {
        let mut winners: HashMap<String, DirectoryEntry> = HashMap::new();
        let mut superseded = Vec::new();

        for entry in scanned {
            match winners.get(&entry.node_id) {
                Some(current) if current.incarnation >= entry.incarnation => {
                    superseded.push(entry);
                }
                _ => {
                    if let Some(loser) = winners.insert(entry.node_id.clone(), entry) {
                        superseded.push(loser);
                    }
                }
            }
        }

        let mut entries: Vec<DirectoryEntry> = winners.into_values().collect();
        entries.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        if !superseded.is_empty() {
            tracing::debug!(
                "Merge found {} superseded incarnation(s): {:?}",
                superseded.len(),
                superseded
                    .iter()
                    .map(|e| format!("{}@{}", e.node_id, e.incarnation))
                    .collect::<Vec<_>>()
            );
        }

        MergeOutcome {
            view: LocalView {
                entries,
                built_at: Some(Utc::now()),
            },
            superseded,
        }
    }
}
