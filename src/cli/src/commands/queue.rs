//! Retry queue commands.
//!
//! Provides list, show, retry, remove, and mode operations on queue entries.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tabled::Tabled;
use uuid::Uuid;

use super::reindex::scope_label;
use crate::client::{ApiClient, ApiError};
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum QueueCommands {
    /// List retry queue entries
    List {
        /// Filter by status (queued, running, failed, completed); repeatable
        #[arg(short, long)]
        status: Vec<String>,

        /// Case-insensitive search over scope, last error, and note
        #[arg(short, long)]
        query: Option<String>,
    },

    /// Show one entry with its retry state
    Show {
        /// Queue entry ID
        queue_id: Uuid,
    },

    /// Retry an entry now
    Retry {
        /// Queue entry ID
        queue_id: Uuid,

        /// Note stored on the retry task
        #[arg(short, long)]
        note: Option<String>,

        /// Retry even when cooling down or exhausted (an exhausted entry switches to manual)
        #[arg(short, long)]
        force: bool,
    },

    /// Dismiss an entry; task history is kept
    Remove {
        /// Queue entry ID
        queue_id: Uuid,
    },

    /// Switch an entry between automatic and manual retries
    Mode {
        /// Queue entry ID
        queue_id: Uuid,

        mode: RetryMode,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    Auto,
    Manual,
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RetryRequest<'a> {
    actor: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<String>,
    force: bool,
}

#[derive(Serialize)]
struct ModeRequest<'a> {
    retry_mode: RetryMode,
    actor: &'a str,
}

#[derive(Debug, Deserialize, Serialize)]
struct QueueEntry {
    queue_id: Uuid,
    original_task_id: Uuid,
    #[serde(default)]
    current_task_id: Option<Uuid>,
    scope: serde_json::Value,
    status: String,
    attempts: u32,
    max_attempts: u32,
    retry_mode: String,
    #[serde(default)]
    cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    note: Option<String>,
    retry_state: String,
    eligible: bool,
    #[serde(default)]
    attempts_remaining: Option<u32>,
}

#[derive(Debug, Serialize, Tabled)]
struct QueueRow {
    #[tabled(rename = "Entry")]
    queue_id: String,
    #[tabled(rename = "Scope")]
    scope: String,
    #[tabled(rename = "State")]
    retry_state: String,
    #[tabled(rename = "Mode")]
    retry_mode: String,
    #[tabled(rename = "Attempts")]
    attempts: String,
    #[tabled(rename = "Cooldown Until")]
    cooldown_until: String,
    #[tabled(rename = "Last Error")]
    last_error: String,
}

impl From<&QueueEntry> for QueueRow {
    fn from(e: &QueueEntry) -> Self {
        Self {
            queue_id: output::short_id(&e.queue_id.to_string()),
            scope: scope_label(&e.scope),
            retry_state: e.retry_state.clone(),
            retry_mode: e.retry_mode.clone(),
            attempts: format!("{}/{}", e.attempts, e.max_attempts),
            cooldown_until: cooldown_label(e.cooldown_until, Utc::now()),
            last_error: output::or_dash(e.last_error.as_deref()),
        }
    }
}

/// Cooldown end with the time left, e.g. `14:05:00 (in 42s)`.
fn cooldown_label(until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    match until {
        Some(until) if until > now => {
            format!("{} (in {}s)", until.format("%H:%M:%S"), (until - now).num_seconds())
        }
        Some(_) => "elapsed".to_string(),
        None => "-".to_string(),
    }
}

/// Suggest a next step for a rejected retry.
fn retry_hint(err: &ApiError) -> Option<String> {
    match err {
        ApiError::Rejected {
            code,
            retry_after_secs,
            ..
        } if code == "NOT_ELIGIBLE" => Some(match retry_after_secs {
            Some(secs) => format!("Cooling down; eligible again in {}s, or pass --force", secs),
            None => "Entry is not eligible; pass --force to retry anyway".to_string(),
        }),
        _ => None,
    }
}

fn print_entry(entry: &QueueEntry, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            output::print_header(&format!("Queue entry {}", entry.queue_id));
            output::print_detail("Scope", &scope_label(&entry.scope));
            output::print_detail("Status", &entry.status);
            output::print_detail("Retry state", &entry.retry_state);
            output::print_detail("Mode", &entry.retry_mode);
            output::print_detail("Attempts", &format!("{}/{}", entry.attempts, entry.max_attempts));
            output::print_detail("Remaining", &output::or_dash(entry.attempts_remaining));
            output::print_detail("Cooldown until", &cooldown_label(entry.cooldown_until, Utc::now()));
            output::print_detail("Last error", &output::or_dash(entry.last_error.as_deref()));
            output::print_detail("Original task", &entry.original_task_id.to_string());
            output::print_detail("Current task", &output::or_dash(entry.current_task_id));
            if let Some(note) = &entry.note {
                output::print_detail("Note", note);
            }
            Ok(())
        }
        _ => output::print_item(entry, format),
    }
}

pub async fn execute(
    cmd: QueueCommands,
    client: &ApiClient,
    actor: &str,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        QueueCommands::List { status, query } => {
            let mut params: Vec<(&str, String)> = Vec::new();
            if !status.is_empty() {
                params.push(("status", status.join(",")));
            }
            if let Some(q) = query {
                params.push(("q", q));
            }

            let entries: Vec<QueueEntry> = client.get_with_query("/reindex/queue", &params).await?;
            match format {
                OutputFormat::Table => {
                    let rows: Vec<QueueRow> = entries.iter().map(QueueRow::from).collect();
                    output::print_list(&rows, format)?;
                }
                _ => output::print_item(&entries, format)?,
            }
        }

        QueueCommands::Show { queue_id } => {
            let entry: QueueEntry = client.get(&format!("/reindex/queue/{}", queue_id)).await?;
            print_entry(&entry, format)?;
        }

        QueueCommands::Retry {
            queue_id,
            note,
            force,
        } => {
            let request = RetryRequest { actor, note, force };
            let entry: QueueEntry = match client
                .post(&format!("/reindex/queue/{}/retry", queue_id), &request)
                .await
            {
                Ok(entry) => entry,
                Err(e) => {
                    if let Some(hint) = e.downcast_ref::<ApiError>().and_then(retry_hint) {
                        output::print_info(&hint);
                    }
                    return Err(e);
                }
            };

            if let OutputFormat::Table = format {
                output::print_success(&format!(
                    "Retry started for '{}' (attempt {})",
                    scope_label(&entry.scope),
                    entry.attempts
                ));
            }
            print_entry(&entry, format)?;
        }

        QueueCommands::Remove { queue_id } => {
            client
                .delete(&format!("/reindex/queue/{}", queue_id), &[("actor", actor)])
                .await?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Queue entry {} removed", queue_id));
                }
                _ => output::print_item(
                    &serde_json::json!({ "queue_id": queue_id, "removed": true }),
                    format,
                )?,
            }
        }

        QueueCommands::Mode { queue_id, mode } => {
            let request = ModeRequest {
                retry_mode: mode,
                actor,
            };
            let entry: QueueEntry = client
                .post(&format!("/reindex/queue/{}/mode", queue_id), &request)
                .await?;
            print_entry(&entry, format)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queue_row_from_wire() {
        let entry: QueueEntry = serde_json::from_value(json!({
            "queue_id": "8f14e45f-ceea-467e-a5b1-0c5d9a7b3e21",
            "original_task_id": "1b4e28ba-2fa1-11d2-883f-0016d3cca427",
            "last_task_id": "1b4e28ba-2fa1-11d2-883f-0016d3cca427",
            "scope": "all",
            "status": "failed",
            "attempts": 3,
            "max_attempts": 3,
            "retry_mode": "auto",
            "last_error": "QUOTA",
            "created_at": "2026-01-01T00:00:00Z",
            "retry_state": "auto_exhausted",
            "eligible": false,
            "attempts_remaining": 0
        }))
        .unwrap();

        let row = QueueRow::from(&entry);
        assert_eq!(row.attempts, "3/3");
        assert_eq!(row.retry_state, "auto_exhausted");
        assert_eq!(row.cooldown_until, "-");
        assert_eq!(row.scope, "all");
    }

    #[test]
    fn test_cooldown_label() {
        let now = Utc::now();
        let until = now + chrono::Duration::seconds(42);
        assert!(cooldown_label(Some(until), now).ends_with("(in 42s)"));
        assert_eq!(cooldown_label(Some(now), now), "elapsed");
        assert_eq!(cooldown_label(None, now), "-");
    }

    #[test]
    fn test_retry_hint_only_for_not_eligible() {
        let cooling = ApiError::Rejected {
            status: reqwest::StatusCode::CONFLICT,
            code: "NOT_ELIGIBLE".into(),
            message: "cooling down".into(),
            retry_after_secs: Some(30),
        };
        assert!(retry_hint(&cooling).unwrap().contains("30s"));

        let busy = ApiError::Rejected {
            status: reqwest::StatusCode::CONFLICT,
            code: "SCOPE_BUSY".into(),
            message: "busy".into(),
            retry_after_secs: None,
        };
        assert!(retry_hint(&busy).is_none());
    }

    #[test]
    fn test_mode_request_wire_format() {
        let body = serde_json::to_value(ModeRequest {
            retry_mode: RetryMode::Manual,
            actor: "ops",
        })
        .unwrap();
        assert_eq!(body, json!({"retry_mode": "manual", "actor": "ops"}));
    }
}
