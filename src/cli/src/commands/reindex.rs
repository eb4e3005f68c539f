//! Reindex submission, history, and audit export commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use tabled::Tabled;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

/// Set by the server on an audit export that lacks records.
const AUDIT_MISSING_HEADER: &str = "x-audit-missing-records";

#[derive(Args)]
pub struct SubmitArgs {
    /// Source keys to reindex
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    pub sources: Vec<String>,

    /// Reindex every source
    #[arg(long)]
    pub all: bool,

    /// Free-text note stored with the task
    #[arg(short, long)]
    pub note: Option<String>,

    /// Link the task to an existing trace
    #[arg(long)]
    pub trace_id: Option<String>,
}

#[derive(Args)]
pub struct HistoryArgs {
    /// Filter by status (queued, retrying, running, completed, partial, failed); repeatable
    #[arg(short, long)]
    pub status: Vec<String>,

    /// Case-insensitive search over actor, scope, and error code
    #[arg(short, long)]
    pub query: Option<String>,
}

#[derive(Subcommand)]
pub enum ReindexCommands {
    /// Submit a reindex for a scope
    Submit(SubmitArgs),

    /// Show grouped task history
    History(HistoryArgs),

    /// Show one task with its timeline
    Task {
        /// Task ID
        task_id: Uuid,
    },

    /// Download the audit trail as NDJSON
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        file: Option<std::path::PathBuf>,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SubmitRequest<'a> {
    scope: serde_json::Value,
    actor: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct SubmitResponse {
    task_id: Uuid,
    status: String,
    scope: serde_json::Value,
    #[serde(default)]
    trace: Option<TraceInfo>,
}

#[derive(Debug, Deserialize, Serialize)]
struct TraceInfo {
    trace_id: String,
    #[serde(default)]
    trace_url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct TaskInfo {
    task_id: Uuid,
    scope: serde_json::Value,
    actor: String,
    status: String,
    created_at: String,
    #[serde(default)]
    duration_ms: Option<i64>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    evidence_diff: Option<serde_json::Value>,
    #[serde(default)]
    trace: Option<TraceInfo>,
    #[serde(default)]
    retry_of: Option<Uuid>,
}

#[derive(Debug, Deserialize, Serialize)]
struct EventInfo {
    sequence: u64,
    status: String,
    timestamp: String,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct TaskHistory {
    task: TaskInfo,
    latest: EventInfo,
    events: Vec<EventInfo>,
}

#[derive(Debug, Serialize, Tabled)]
struct HistoryRow {
    #[tabled(rename = "Task")]
    task_id: String,
    #[tabled(rename = "Scope")]
    scope: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Actor")]
    actor: String,
    #[tabled(rename = "Duration (ms)")]
    duration_ms: String,
    #[tabled(rename = "Error")]
    error_code: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl From<&TaskHistory> for HistoryRow {
    fn from(h: &TaskHistory) -> Self {
        Self {
            task_id: output::short_id(&h.task.task_id.to_string()),
            scope: scope_label(&h.task.scope),
            status: h.latest.status.clone(),
            actor: h.task.actor.clone(),
            duration_ms: output::or_dash(h.task.duration_ms),
            error_code: output::or_dash(h.task.error_code.as_deref()),
            updated: h.latest.timestamp.clone(),
        }
    }
}

/// Render a wire scope (`"all"` or a list of keys) as text.
pub fn scope_label(scope: &serde_json::Value) -> String {
    match scope {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(keys) => keys
            .iter()
            .filter_map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

fn submit_scope(args: &SubmitArgs) -> serde_json::Value {
    if args.all {
        serde_json::Value::String("all".into())
    } else {
        serde_json::json!(args.sources)
    }
}

pub async fn execute(
    cmd: ReindexCommands,
    client: &ApiClient,
    actor: &str,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        ReindexCommands::Submit(args) => {
            let request = SubmitRequest {
                scope: submit_scope(&args),
                actor,
                note: args.note,
                trace_id: args.trace_id,
            };
            let resp: SubmitResponse = client.post("/reindex", &request).await?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!(
                        "Reindex of '{}' accepted as task {} ({})",
                        scope_label(&resp.scope),
                        resp.task_id,
                        resp.status
                    ));
                    if let Some(url) = resp.trace.as_ref().and_then(|t| t.trace_url.as_deref()) {
                        output::print_detail("Trace", url);
                    }
                }
                _ => output::print_item(&resp, format)?,
            }
        }

        ReindexCommands::History(args) => {
            let mut query: Vec<(&str, String)> = Vec::new();
            if !args.status.is_empty() {
                query.push(("status", args.status.join(",")));
            }
            if let Some(q) = args.query {
                query.push(("q", q));
            }

            let history: Vec<TaskHistory> = client.get_with_query("/reindex/history", &query).await?;
            match format {
                OutputFormat::Table => {
                    let rows: Vec<HistoryRow> = history.iter().map(HistoryRow::from).collect();
                    output::print_list(&rows, format)?;
                }
                _ => output::print_item(&history, format)?,
            }
        }

        ReindexCommands::Task { task_id } => {
            let history: TaskHistory = client.get(&format!("/reindex/tasks/{}", task_id)).await?;

            match format {
                OutputFormat::Table => {
                    let task = &history.task;
                    output::print_header(&format!("Task {}", task.task_id));
                    output::print_detail("Scope", &scope_label(&task.scope));
                    output::print_detail("Status", &task.status);
                    output::print_detail("Actor", &task.actor);
                    output::print_detail("Created", &task.created_at);
                    output::print_detail("Duration (ms)", &output::or_dash(task.duration_ms));
                    if let Some(code) = &task.error_code {
                        let message = task.error_message.as_deref().unwrap_or("");
                        output::print_detail("Error", &format!("{} {}", code, message));
                    }
                    if let Some(queue_id) = task.retry_of {
                        output::print_detail("Retry of", &queue_id.to_string());
                    }
                    if let Some(diff) = &task.evidence_diff {
                        output::print_detail("Evidence", &diff.to_string());
                    }
                    if let Some(url) = task.trace.as_ref().and_then(|t| t.trace_url.as_deref()) {
                        output::print_detail("Trace", url);
                    }

                    output::print_header("Timeline");
                    for event in &history.events {
                        let note = event.note.as_deref().unwrap_or("");
                        println!("  #{:<5} {:<26} {:<10} {}", event.sequence, event.timestamp, event.status, note);
                    }
                }
                _ => output::print_item(&history, format)?,
            }
        }

        ReindexCommands::Export { file } => {
            let (body, missing) = client
                .get_text("/reindex/audit/export", AUDIT_MISSING_HEADER)
                .await?;
            if let Some(missing) = missing {
                output::print_warning(&format!(
                    "Export is missing {} records evicted from server memory",
                    missing
                ));
            }
            match file {
                Some(path) => {
                    std::fs::write(&path, &body)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    output::print_success(&format!(
                        "Wrote {} audit records to {}",
                        body.lines().count(),
                        path.display()
                    ));
                }
                None => print!("{}", body),
            }
        }
    }

    Ok(())
}
