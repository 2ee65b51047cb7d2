//! HTTP API Server
//!
//! Read-only observability surface: lets operators see whether a node is
//! stuck outside ACTIVE and what its current peer view looks like.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::agent::{AgentState, AgentStatus, MembershipAgent};
use crate::config::ApiConfig;
use crate::directory::DirectoryEntry;
use crate::error::{Error, Result};

/// Shared application state
pub struct AppState {
    /// The node's membership agent
    pub agent: Arc<MembershipAgent>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, agent: Arc<MembershipAgent>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { agent }),
        }
    }

    /// Create the router
    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/status", get(handle_status))
            .route("/peers", get(handle_peers))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            // Parked so the caller's select keeps the other branches alive
            std::future::pending::<()>().await;
        }

        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Peers response: the node's current LocalView
#[derive(Debug, Serialize)]
pub struct PeersResponse {
    pub count: usize,
    pub built_at: Option<DateTime<Utc>>,
    pub peers: Vec<DirectoryEntry>,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub state: AgentState,
}

// ============ Handlers ============

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<AgentStatus> {
    Json(state.agent.status().await)
}

async fn handle_peers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let view = state.agent.view().borrow().clone();
    Json(PeersResponse {
        count: view.len(),
        built_at: view.built_at,
        peers: view.entries,
    })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let agent_state = state.agent.state().await;
    Json(HealthResponse {
        healthy: agent_state != AgentState::Failed,
        node_id: state.agent.node_id().to_string(),
        state: agent_state,
    })
}
