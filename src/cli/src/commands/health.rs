//! Health check command.
//!
//! Queries the `/health` endpoint and displays engine counters.

use anyhow::Result;
use clap::Args;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include task and queue counters
    #[arg(short, long)]
    detailed: bool,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: serde_json::Value = client.get_raw("/health").await?;

    match format {
        OutputFormat::Table => {
            let status = health
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");

            output::print_header("System Health");
            output::print_detail("Status", status);
            output::print_detail("API URL", client.base_url());

            if let Some(version) = health.get("version").and_then(|v| v.as_str()) {
                output::print_detail("Version", version);
            }

            if let Some(ts) = health.get("timestamp").and_then(|v| v.as_str()) {
                output::print_detail("Timestamp", ts);
            }

            if args.detailed {
                output::print_header("Engine");
                for (key, label) in [
                    ("running_tasks", "Running tasks"),
                    ("queue_depth", "Queue depth"),
                    ("total_tasks", "Total tasks"),
                ] {
                    let value = health.get(key).and_then(|v| v.as_u64());
                    output::print_detail(label, &output::or_dash(value));
                }
            }

            if status == "healthy" || status == "ok" {
                output::print_success("All systems operational");
            } else {
                output::print_error(&format!("System status: {}", status));
            }
        }
        _ => output::print_item(&health, format)?,
    }

    Ok(())
}
