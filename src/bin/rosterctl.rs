//! rosterctl - Rosterd control CLI
//!
//! Thin client for the rosterd HTTP API.

use anyhow::Context;
use clap::{Parser, Subcommand};

/// Rosterd control CLI
#[derive(Parser)]
#[command(name = "rosterctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Node API address (host:port)
    #[arg(short, long, default_value = "localhost:8080")]
    address: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node status (agent state, incarnation, endpoint)
    Status,

    /// Show the node's current peer view
    Peers,

    /// Check node health
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = match cli.command {
        Commands::Status => "/status",
        Commands::Peers => "/peers",
        Commands::Health => "/health",
    };

    let url = format!("http://{}{}", cli.address, path);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach {}", url))?;

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .context("Failed to parse response body")?;

    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        anyhow::bail!("Node returned {}", status);
    }

    Ok(())
}
