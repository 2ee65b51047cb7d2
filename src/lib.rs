//! Rosterd - SQL-Directory Cluster Membership Agent
//!
//! A per-node membership agent for clusters whose processes cannot address
//! each other directly. Each node observes only a non-routable local
//! address, so conventional peer lists and multicast discovery fail.
//! Instead, nodes rendezvous through a shared SQL table: every node
//! resolves its own routable address, publishes a directory entry,
//! refreshes it periodically, and scans the table to build its view of
//! live peers.
//!
//! # Architecture
//!
//! - Address resolution retries a name lookup until the platform has wired
//!   the node's network identity; exhaustion is fatal.
//! - The directory table is the only coordination channel; each node
//!   writes its own `(node_id, incarnation)` row, so no lock is needed.
//! - Restarts register a higher incarnation; the view merger keeps the
//!   highest incarnation per node and prunes superseded rows after a grace
//!   period. Views converge eventually, bounded by the refresh period plus
//!   the staleness window.
//!
//! The resulting LocalView is handed to the application layer, which
//! establishes its own cluster transport from it.

pub mod agent;
pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod resolver;
pub mod view;

pub use config::RosterdConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::agent::{AgentState, MembershipAgent, NodeIdentity};
    pub use crate::config::RosterdConfig;
    pub use crate::directory::{DirectoryEntry, DirectoryStore, MemoryStore, SqlStore};
    pub use crate::error::{Error, Result};
    pub use crate::resolver::{DnsResolver, NameResolver};
    pub use crate::view::{LocalView, ViewMerger};
}
