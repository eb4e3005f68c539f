//! reindexctl - Command-line interface for the reindex job engine.
//!
//! Provides commands for submission, history, the retry queue, audit export,
//! health, and configuration management.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config, health, queue, reindex};
use output::OutputFormat;

/// reindexctl - Reindex Job Engine CLI
#[derive(Parser)]
#[command(
    name = "reindexctl",
    version,
    about = "Reindex Job Engine CLI",
    long_about = "Submit reindex tasks, inspect history, and operate the retry queue.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "REINDEX_API_URL")]
    api_url: Option<String>,

    /// Actor recorded on submissions, retries, and queue changes
    #[arg(long, global = true, env = "REINDEX_ACTOR")]
    actor: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Reindex(reindex::ReindexCommands),

    /// Retry queue operations
    #[command(subcommand)]
    Queue(queue::QueueCommands),

    /// Check system health
    Health(health::HealthArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

fn resolve_actor(explicit: Option<String>) -> String {
    explicit
        .or_else(config::load_actor)
        .or_else(|| std::env::var("USER").ok())
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| "reindexctl".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(config::load_api_url)
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let client = client::ApiClient::new(&api_url)?;
    let actor = resolve_actor(cli.actor);
    let format = cli.output;

    let result = match cli.command {
        Commands::Reindex(cmd) => reindex::execute(cmd, &client, &actor, format).await,
        Commands::Queue(cmd) => queue::execute(cmd, &client, &actor, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
