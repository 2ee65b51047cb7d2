//! Rosterd - SQL-Directory Cluster Membership Agent
//!
//! Registers this node in the shared discovery directory, keeps the entry
//! fresh, and maintains a local view of live peers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rosterd::agent::{MembershipAgent, NodeIdentity};
use rosterd::api::HttpServer;
use rosterd::config::RosterdConfig;
use rosterd::directory::SqlStore;
use rosterd::error::{Error, Result};
use rosterd::resolver::DnsResolver;

/// Rosterd - SQL-directory cluster membership agent
#[derive(Parser)]
#[command(name = "rosterd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "rosterd.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the membership agent
    Start,

    /// Check node status via the HTTP API
    Status {
        /// Node address to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "rosterd.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Clear the shared directory (operator reset); nodes re-register
    /// within one refresh period
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Reset => run_reset(cli.config).await,
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the membership agent
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting rosterd node...");

    let config = match RosterdConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    let store = Arc::new(SqlStore::open(&config.database)?);

    // Ensure the rendezvous table exists; the database may not be up yet,
    // so keep trying rather than crash
    loop {
        match store.ensure_schema().await {
            Ok(()) => break,
            Err(e) => {
                tracing::warn!("Directory not reachable yet, retrying in 5s: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Received shutdown signal");
                        return Ok(());
                    }
                }
            }
        }
    }

    let agent = Arc::new(MembershipAgent::new(
        NodeIdentity::from_config(&config),
        config.discovery.clone(),
        Arc::new(DnsResolver),
        store,
    ));
    tracing::info!(
        "Node {} starting as incarnation {}",
        agent.node_id(),
        agent.incarnation()
    );

    let http_server = HttpServer::new(config.api.clone(), Arc::clone(&agent));

    let runner = Arc::clone(&agent);
    let mut agent_task = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut agent_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("Membership agent failed: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    return Err(Error::Internal(format!("Agent task panicked: {}", e)));
                }
            }
        }
        result = http_server.start() => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            agent.shutdown();
            // Let the loop finish its best-effort deregistration
            if let Ok(Err(e)) = (&mut agent_task).await {
                tracing::warn!("Agent shutdown error: {}", e);
            }
        }
    }

    tracing::info!("Rosterd shutdown complete");
    Ok(())
}

/// Check node status
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::Network(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&status).unwrap());
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(Error::Network(e.to_string()))
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(
        r#"# Rosterd Configuration
# Generated configuration file

[node]
id = "{node_id}"
port = 7800
# Name handed to the resolver; defaults to the node id
# logical_name = "{node_id}.internal"
# Fixed routable address; skips name resolution when set
# advertise_address = "10.0.0.5"

[database]
host = "localhost"
port = 3306
user = "roster"
password = "changeme"
database = "roster"
pool_size = 5
connect_timeout_secs = 30

[discovery]
max_resolve_retries = 30
resolve_retry_interval_ms = 5000
refresh_period_ms = 10000
staleness_window_ms = 30000
prune_incarnation_grace_ms = 10000

[api]
enabled = true
bind_address = "0.0.0.0:8080"

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your database and node identity.");
    println!("Then start with: rosterd start --config {}", output.display());

    Ok(())
}

/// Clear the shared directory
async fn run_reset(config_path: PathBuf) -> Result<()> {
    let config = RosterdConfig::from_file(&config_path)?;
    let store = SqlStore::open(&config.database)?;
    store.truncate().await?;
    println!("Directory cleared. Live nodes re-register within one refresh period.");
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match RosterdConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID:          {}", config.node.id);
            println!("  Logical Name:     {}", config.logical_name());
            println!("  Port:             {}", config.node.port);
            println!(
                "  Database:         {}@{}:{}/{}",
                config.database.user,
                config.database.host,
                config.database.port,
                config.database.database
            );
            println!(
                "  Refresh Period:   {} ms",
                config.discovery.refresh_period_ms
            );
            println!(
                "  Staleness Window: {} ms",
                config.discovery.staleness_window_ms
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
