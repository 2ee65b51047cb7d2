//! Membership Agent
//!
//! Per-node control loop: resolve own address, register in the shared
//! directory, then refresh the entry and rebuild the local peer view on a
//! fixed period. One independent loop per node; nodes coordinate only
//! through the directory.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;

use crate::config::{DiscoveryConfig, RosterdConfig};
use crate::directory::{DirectoryEntry, DirectoryStore};
use crate::error::Result;
use crate::resolver::{resolve_with_retry, NameResolver};
use crate::view::{LocalView, MergeOutcome, ViewMerger};

/// Agent lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AgentState {
    /// Created, not yet started
    Init,
    /// Resolving own routable address
    Resolving,
    /// Address known, first registration not yet acknowledged
    Registering,
    /// Registered and cycling
    Active,
    /// Mid-cycle refresh in progress
    Refreshing,
    /// Address resolution exhausted; terminal
    Failed,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Init => write!(f, "INIT"),
            AgentState::Resolving => write!(f, "RESOLVING"),
            AgentState::Registering => write!(f, "REGISTERING"),
            AgentState::Active => write!(f, "ACTIVE"),
            AgentState::Refreshing => write!(f, "REFRESHING"),
            AgentState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Node identity handed in by the execution environment
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    /// Stable logical identifier
    pub node_id: String,
    /// Name handed to the resolver
    pub logical_name: String,
    /// Externally-reachable port assignment
    pub port: u16,
    /// Fixed routable address; skips resolution when set
    pub advertise_address: Option<String>,
}

impl NodeIdentity {
    pub fn from_config(config: &RosterdConfig) -> Self {
        Self {
            node_id: config.node.id.clone(),
            logical_name: config.logical_name().to_string(),
            port: config.node.port,
            advertise_address: config.node.advertise_address.clone(),
        }
    }
}

/// Point-in-time agent status for the HTTP API
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub node_id: String,
    pub incarnation: i64,
    pub state: AgentState,
    pub endpoint: Option<String>,
    pub joined: bool,
    pub peer_count: usize,
}

/// Per-node membership control loop
pub struct MembershipAgent {
    identity: NodeIdentity,
    config: DiscoveryConfig,
    resolver: Arc<dyn NameResolver>,
    store: Arc<dyn DirectoryStore>,
    /// Bumped every process start; epoch milliseconds at construction
    incarnation: i64,
    state: RwLock<AgentState>,
    /// Own registered entry, set once the first upsert succeeds
    own_entry: RwLock<Option<DirectoryEntry>>,
    view_tx: watch::Sender<LocalView>,
    shutdown_tx: watch::Sender<bool>,
}

impl MembershipAgent {
    /// Create a new agent. The incarnation is derived from the wall clock
    /// at construction, so every restart of the same logical node
    /// registers under a strictly higher incarnation.
    pub fn new(
        identity: NodeIdentity,
        config: DiscoveryConfig,
        resolver: Arc<dyn NameResolver>,
        store: Arc<dyn DirectoryStore>,
    ) -> Self {
        let (view_tx, _) = watch::channel(LocalView::empty());
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            identity,
            config,
            resolver,
            store,
            incarnation: chrono::Utc::now().timestamp_millis(),
            state: RwLock::new(AgentState::Init),
            own_entry: RwLock::new(None),
            view_tx,
            shutdown_tx,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    pub fn incarnation(&self) -> i64 {
        self.incarnation
    }

    /// Current lifecycle state
    pub async fn state(&self) -> AgentState {
        *self.state.read().await
    }

    /// Subscribe to LocalView updates; one fresh view per scan cycle
    pub fn view(&self) -> watch::Receiver<LocalView> {
        self.view_tx.subscribe()
    }

    /// Signal the control loop to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Status snapshot for the HTTP API
    pub async fn status(&self) -> AgentStatus {
        let view = self.view_tx.borrow().clone();
        let endpoint = self.own_entry.read().await.as_ref().map(|e| e.endpoint());

        AgentStatus {
            node_id: self.identity.node_id.clone(),
            incarnation: self.incarnation,
            state: self.state().await,
            endpoint,
            joined: view.contains_incarnation(&self.identity.node_id, self.incarnation),
            peer_count: view.len(),
        }
    }

    /// Run the control loop until shutdown.
    ///
    /// Returns an error only for fatal conditions (resolution exhausted);
    /// the process must then exit non-zero so the orchestrator restarts
    /// it. Store failures are absorbed and retried on the refresh
    /// schedule.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();

        self.transition(AgentState::Resolving).await;
        let address = match &self.identity.advertise_address {
            Some(addr) => {
                tracing::info!("Using configured advertise address {}", addr);
                addr.clone()
            }
            None => {
                let resolved = tokio::select! {
                    r = resolve_with_retry(
                        self.resolver.as_ref(),
                        &self.identity.logical_name,
                        &self.config,
                    ) => r,
                    _ = shutdown_signalled(&mut shutdown) => return Ok(()),
                };
                match resolved {
                    Ok(ip) => ip.to_string(),
                    Err(e) => {
                        tracing::error!(
                            "Cannot determine own address for '{}': {}",
                            self.identity.logical_name,
                            e
                        );
                        self.transition(AgentState::Failed).await;
                        return Err(e);
                    }
                }
            }
        };

        self.transition(AgentState::Registering).await;
        loop {
            let entry = self.own_entry_now(&address);
            match self.store.upsert(&entry).await {
                Ok(()) => {
                    tracing::info!(
                        "Registered {}@{} as {}",
                        entry.node_id,
                        entry.incarnation,
                        entry.endpoint()
                    );
                    *self.own_entry.write().await = Some(entry);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        "Degraded membership: registration failed, retrying in {:?}: {}",
                        self.config.refresh_period(),
                        e
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.refresh_period()) => {}
                _ = shutdown_signalled(&mut shutdown) => return Ok(()),
            }
        }
        self.transition(AgentState::Active).await;

        // Spread co-started nodes so their prune passes do not line up
        let jitter_ms = rand::thread_rng().gen_range(0..=(self.config.refresh_period_ms / 10).max(1));
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {}
            _ = shutdown_signalled(&mut shutdown) => return Ok(()),
        }

        let mut ticker = tokio::time::interval(self.config.refresh_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.cycle(&address).await,
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }

        self.deregister().await;
        Ok(())
    }

    /// One refresh cycle: re-upsert own entry, rebuild the view, prune.
    async fn cycle(&self, address: &str) {
        self.transition(AgentState::Refreshing).await;

        let entry = self.own_entry_now(address);
        match self.store.upsert(&entry).await {
            Ok(()) => {
                *self.own_entry.write().await = Some(entry);
            }
            Err(e) => {
                tracing::warn!(
                    "Degraded membership: refresh failed, own entry may go stale: {}",
                    e
                );
            }
        }

        match self.store.scan_live(self.config.staleness_window()).await {
            Ok(scanned) => {
                let outcome = ViewMerger::merge(scanned);
                if !outcome
                    .view
                    .contains_incarnation(&self.identity.node_id, self.incarnation)
                {
                    tracing::debug!("Own entry not yet visible in directory scan");
                }
                self.prune(&outcome).await;
                self.view_tx.send_replace(outcome.view);
            }
            Err(e) => {
                tracing::warn!("Degraded membership: directory scan failed: {}", e);
            }
        }

        self.transition(AgentState::Active).await;
    }

    /// Background pruning pass. Idempotent and safe to run from every
    /// node: deletes are condition-checked on age inside the store.
    async fn prune(&self, outcome: &MergeOutcome) {
        match self.store.delete_stale(self.config.staleness_window()).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Pruned {} stale directory entr(ies)", n),
            Err(e) => tracing::warn!("Stale-entry prune failed: {}", e),
        }

        let mut pruned_nodes = std::collections::BTreeSet::new();
        for stale in &outcome.superseded {
            if !pruned_nodes.insert(stale.node_id.as_str()) {
                continue;
            }
            let Some(winner) = outcome.view.get(&stale.node_id) else {
                continue;
            };
            match self
                .store
                .delete_superseded(
                    &stale.node_id,
                    winner.incarnation,
                    self.config.prune_incarnation_grace(),
                )
                .await
            {
                Ok(0) => {}
                Ok(n) => tracing::info!(
                    "Pruned {} superseded incarnation(s) of {}",
                    n,
                    stale.node_id
                ),
                Err(e) => tracing::warn!(
                    "Superseded-incarnation prune for {} failed: {}",
                    stale.node_id,
                    e
                ),
            }
        }
    }

    /// Best-effort removal of our own row on shutdown. Failure is fine;
    /// the entry ages out naturally.
    pub async fn deregister(&self) {
        let entry = self.own_entry.read().await.clone();
        if let Some(entry) = entry {
            match self.store.remove(&entry.node_id, entry.incarnation).await {
                Ok(()) => tracing::info!(
                    "Deregistered {}@{}",
                    entry.node_id,
                    entry.incarnation
                ),
                Err(e) => tracing::debug!("Best-effort deregistration failed: {}", e),
            }
        }
    }

    fn own_entry_now(&self, address: &str) -> DirectoryEntry {
        DirectoryEntry::new(
            &self.identity.node_id,
            self.incarnation,
            address,
            self.identity.port,
        )
    }

    async fn transition(&self, next: AgentState) {
        let mut state = self.state.write().await;
        if *state != next {
            tracing::debug!("Agent state {} -> {}", state, next);
            *state = next;
        }
    }
}

/// Resolves once the shutdown flag is set
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped without signalling; never resolves
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryStore;
    use crate::resolver::tests::FlakyResolver;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn identity(node_id: &str) -> NodeIdentity {
        NodeIdentity {
            node_id: node_id.to_string(),
            logical_name: node_id.to_string(),
            port: 7800,
            advertise_address: None,
        }
    }

    fn fast_discovery() -> DiscoveryConfig {
        DiscoveryConfig {
            max_resolve_retries: 30,
            resolve_retry_interval_ms: 5000,
            refresh_period_ms: 10_000,
            staleness_window_ms: 30_000,
            prune_incarnation_grace_ms: 10_000,
        }
    }

    fn agent_with(
        node_id: &str,
        resolver: Arc<FlakyResolver>,
        store: Arc<MemoryStore>,
    ) -> Arc<MembershipAgent> {
        Arc::new(MembershipAgent::new(
            identity(node_id),
            fast_discovery(),
            resolver,
            store,
        ))
    }

    async fn wait_for_join(agent: &MembershipAgent) {
        let mut view = agent.view();
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                if view
                    .borrow()
                    .contains_incarnation(agent.node_id(), agent.incarnation())
                {
                    return;
                }
                view.changed().await.unwrap();
            }
        })
        .await
        .expect("agent never joined");
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_registers_and_joins() {
        let store = Arc::new(MemoryStore::new());
        let resolver = Arc::new(FlakyResolver::new(0, vec![ip("10.0.0.4")]));
        let agent = agent_with("node-a", resolver, Arc::clone(&store));

        let runner = Arc::clone(&agent);
        let handle = tokio::spawn(async move { runner.run().await });

        wait_for_join(&agent).await;

        let state = agent.state().await;
        assert!(matches!(state, AgentState::Active | AgentState::Refreshing));

        let status = agent.status().await;
        assert!(status.joined);
        assert_eq!(status.endpoint.as_deref(), Some("10.0.0.4:7800"));

        let live = store.scan_live(Duration::from_secs(30)).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].node_id, "node-a");

        agent.shutdown();
        handle.await.unwrap().unwrap();

        // Shutdown deregistered the entry
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolver_exhaustion_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        let resolver = Arc::new(FlakyResolver::new(u32::MAX, vec![]));
        let agent = agent_with("node-a", resolver, Arc::clone(&store));

        let err = agent.run().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(agent.state().await, AgentState::Failed);
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolver_success_on_last_attempt() {
        let store = Arc::new(MemoryStore::new());
        let resolver = Arc::new(FlakyResolver::new(29, vec![ip("10.0.0.4")]));
        let agent = agent_with("node-a", resolver, Arc::clone(&store));

        let runner = Arc::clone(&agent);
        let handle = tokio::spawn(async move { runner.run().await });

        wait_for_join(&agent).await;
        assert_ne!(agent.state().await, AgentState::Failed);

        agent.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_retries_through_store_outage() {
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let resolver = Arc::new(FlakyResolver::new(0, vec![ip("10.0.0.4")]));
        let agent = agent_with("node-a", resolver, Arc::clone(&store));

        let runner = Arc::clone(&agent);
        let handle = tokio::spawn(async move { runner.run().await });

        // Store down: agent parks in REGISTERING, never FAILED
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(agent.state().await, AgentState::Registering);

        store.set_failing(false);
        wait_for_join(&agent).await;

        agent.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_stays_active_through_store_outage() {
        let store = Arc::new(MemoryStore::new());
        let resolver = Arc::new(FlakyResolver::new(0, vec![ip("10.0.0.4")]));
        let agent = agent_with("node-a", resolver, Arc::clone(&store));

        let runner = Arc::clone(&agent);
        let handle = tokio::spawn(async move { runner.run().await });
        wait_for_join(&agent).await;

        // Three refresh cycles of outage
        store.set_failing(true);
        tokio::time::sleep(3 * fast_discovery().refresh_period()).await;
        let state = agent.state().await;
        assert!(matches!(state, AgentState::Active | AgentState::Refreshing));

        // Entry reappears as live within one cycle of recovery
        store.set_failing(false);
        tokio::time::sleep(2 * fast_discovery().refresh_period()).await;
        let live = store.scan_live(Duration::from_secs(30)).await.unwrap();
        assert!(live.iter().any(|e| e.node_id == "node-a"));

        agent.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_agents_see_each_other() {
        let store = Arc::new(MemoryStore::new());
        let agent_a = agent_with(
            "node-a",
            Arc::new(FlakyResolver::new(0, vec![ip("10.0.0.1")])),
            Arc::clone(&store),
        );
        let agent_b = agent_with(
            "node-b",
            Arc::new(FlakyResolver::new(0, vec![ip("10.0.0.2")])),
            Arc::clone(&store),
        );

        let run_a = Arc::clone(&agent_a);
        let run_b = Arc::clone(&agent_b);
        let handle_a = tokio::spawn(async move { run_a.run().await });
        let handle_b = tokio::spawn(async move { run_b.run().await });

        wait_for_join(&agent_a).await;
        wait_for_join(&agent_b).await;

        // Another cycle so each scan sees the other's registration
        tokio::time::sleep(2 * fast_discovery().refresh_period()).await;

        let view_a = agent_a.view().borrow().clone();
        let view_b = agent_b.view().borrow().clone();
        assert_eq!(view_a.len(), 2);
        assert_eq!(view_a.endpoints(), view_b.endpoints());
        assert_eq!(
            view_a.endpoints(),
            vec!["10.0.0.1:7800", "10.0.0.2:7800"]
        );

        agent_a.shutdown();
        agent_b.shutdown();
        handle_a.await.unwrap().unwrap();
        handle_b.await.unwrap().unwrap();
    }
}
