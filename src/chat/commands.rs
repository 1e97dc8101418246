//! Chat command parsing and rendering.
//!
//! Commands use a `!` prefix and bypass the agent entirely. The status
//! block tolerates legacy conversation records by omitting whatever a
//! record does not carry rather than failing the render.

use chrono::{DateTime, Utc};

use crate::session::ConversationRecord;

/// The minimal command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCommand {
    Reset,
    Status,
    Help,
}

/// Parse a message as a command. Unknown `!` words are not commands; they
/// flow to the agent like any other text.
pub fn parse_command(text: &str) -> Option<ChatCommand> {
    let trimmed = text.trim();
    match trimmed {
        "!reset" => Some(ChatCommand::Reset),
        "!status" => Some(ChatCommand::Status),
        "!help" => Some(ChatCommand::Help),
        _ => None,
    }
}

pub fn render_help() -> String {
    [
        "*Commands*",
        "`!reset` — start this thread's conversation over with a fresh session",
        "`!status` — show session, token usage, and agent configuration",
        "`!help` — this message",
    ]
    .join("\n")
}

/// Inputs to the status block beyond the conversation record itself.
#[derive(Debug, Clone)]
pub struct StatusContext {
    pub agent_name: String,
    pub connected: bool,
    pub connected_at: Option<DateTime<Utc>>,
    /// Most recent job started for this conversation, if any.
    pub last_job_id: Option<String>,
    pub now: DateTime<Utc>,
}

/// Render the `!status` block.
pub fn render_status(ctx: &StatusContext, record: Option<&ConversationRecord>) -> String {
    let mut lines = Vec::new();

    let connection = if ctx.connected {
        match ctx.connected_at {
            Some(at) => format!(
                "connected, up {}",
                humanize(ctx.now.signed_duration_since(at))
            ),
            None => "connected".to_string(),
        }
    } else {
        "disconnected".to_string()
    };
    lines.push(format!("*{}* — {}", ctx.agent_name, connection));

    let Some(record) = record else {
        lines.push("No conversation in this thread yet.".to_string());
        return lines.join("\n");
    };

    match &record.session_id {
        Some(session_id) => {
            let mut session_line = format!("Session `{}`", truncate_id(session_id));
            if let Some(started) = record.session_started_at {
                session_line.push_str(&format!(
                    ", started {}, running {}",
                    started.format("%Y-%m-%d %H:%M UTC"),
                    humanize(ctx.now.signed_duration_since(started))
                ));
            }
            lines.push(session_line);
        }
        None => lines.push("No active session.".to_string()),
    }

    lines.push(format!("Messages: {}", record.message_count));

    if let Some(usage) = &record.context_usage {
        let mut usage_line = format!(
            "Tokens: {} in / {} out / {} total",
            usage.input_tokens, usage.output_tokens, usage.total_tokens
        );
        if let Some(window) = usage.context_window.filter(|w| *w > 0) {
            let percent = (usage.total_tokens as f64 / window as f64) * 100.0;
            usage_line.push_str(&format!(
                " ({:.1}% of {}k context{})",
                percent,
                window / 1000,
                severity_indicator(percent)
            ));
        }
        lines.push(usage_line);
    }

    if let Some(snapshot) = &record.agent_config_snapshot {
        let model = snapshot.model.as_deref().unwrap_or("default");
        let mut config_line = format!(
            "Config: model {}, permissions {}",
            model, snapshot.permission_mode
        );
        if !snapshot.mcp_servers.is_empty() {
            config_line.push_str(&format!(", mcp [{}]", snapshot.mcp_servers.join(", ")));
        }
        lines.push(config_line);
    }

    if let Some(job_id) = &ctx.last_job_id {
        lines.push(format!("Last job: `{}`", job_id));
    }

    lines.join("\n")
}

/// Session IDs are opaque and long; show enough to correlate logs.
fn truncate_id(id: &str) -> String {
    if id.chars().count() <= 12 {
        id.to_string()
    } else {
        let head: String = id.chars().take(12).collect();
        format!("{}…", head)
    }
}

fn severity_indicator(percent: f64) -> &'static str {
    if percent >= 95.0 {
        " ‼️"
    } else if percent >= 90.0 {
        " ⚠️"
    } else if percent >= 75.0 {
        " ⚡"
    } else {
        ""
    }
}

fn humanize(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else if secs < 86_400 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d{}h", secs / 86_400, (secs % 86_400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AgentConfigSnapshot, ContextUsage};

    fn ctx() -> StatusContext {
        StatusContext {
            agent_name: "assistant".to_string(),
            connected: true,
            connected_at: Some(Utc::now() - chrono::Duration::minutes(5)),
            last_job_id: Some("2024-01-01-abc123def456".to_string()),
            now: Utc::now(),
        }
    }

    fn full_record(total: u64, window: u64) -> ConversationRecord {
        ConversationRecord {
            session_id: Some("sess-0123456789abcdef".to_string()),
            session_started_at: Some(Utc::now() - chrono::Duration::minutes(3)),
            last_message_at: Utc::now(),
            message_count: 5,
            context_usage: Some(ContextUsage {
                input_tokens: total - 150,
                output_tokens: 150,
                total_tokens: total,
                context_window: Some(window),
                last_updated: Some(Utc::now()),
            }),
            agent_config_snapshot: Some(AgentConfigSnapshot {
                model: Some("claude-sonnet-4-5".to_string()),
                permission_mode: "acceptEdits".to_string(),
                mcp_servers: vec!["search".to_string()],
            }),
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("!reset"), Some(ChatCommand::Reset));
        assert_eq!(parse_command("  !status  "), Some(ChatCommand::Status));
        assert_eq!(parse_command("!help"), Some(ChatCommand::Help));
        assert_eq!(parse_command("!unknown"), None);
        assert_eq!(parse_command("reset"), None);
        assert_eq!(parse_command("please !reset"), None);
    }

    #[test]
    fn test_status_full_record() {
        let status = render_status(&ctx(), Some(&full_record(1150, 200_000)));
        assert!(status.contains("connected, up"));
        assert!(status.contains("sess-0123456…"));
        assert!(status.contains("Last job: `2024-01-01-abc123def456`"));
        assert!(status.contains("Messages: 5"));
        assert!(status.contains("1000 in / 150 out / 1150 total"));
        assert!(status.contains("claude-sonnet-4-5"));
        assert!(status.contains("acceptEdits"));
        assert!(status.contains("mcp [search]"));
    }

    #[test]
    fn test_status_severity_thresholds() {
        let low = render_status(&ctx(), Some(&full_record(100_000, 200_000)));
        assert!(!low.contains('⚡') && !low.contains('⚠') && !low.contains('‼'));

        let warn = render_status(&ctx(), Some(&full_record(160_000, 200_000)));
        assert!(warn.contains('⚡'));

        let high = render_status(&ctx(), Some(&full_record(185_000, 200_000)));
        assert!(high.contains('⚠'));

        let critical = render_status(&ctx(), Some(&full_record(195_000, 200_000)));
        assert!(critical.contains('‼'));
    }

    #[test]
    fn test_status_legacy_record_renders() {
        // A migrated v1/v2 record: no usage, no snapshot, no start time.
        let record = ConversationRecord {
            session_id: Some("S1".to_string()),
            session_started_at: None,
            last_message_at: Utc::now(),
            message_count: 0,
            context_usage: None,
            agent_config_snapshot: None,
        };
        let status = render_status(&ctx(), Some(&record));
        assert!(status.contains("Session `S1`"));
        assert!(!status.contains("Tokens:"));
        assert!(!status.contains("Config:"));
    }

    #[test]
    fn test_status_without_record() {
        let status = render_status(&ctx(), None);
        assert!(status.contains("No conversation"));
    }
}
