//! Job records and the append-only job output log.
//!
//! One job is the record of one agent turn. Jobs live under
//! `<state>/jobs/<job-id>/` with a JSON record, a line-delimited structured
//! event log, and optionally a human-readable `output.log`. The record's
//! status only ever advances pending → running → (completed | failed).

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{ExitReason, FleetError, Result};
use crate::utils::fs::atomic_write_json;
use crate::utils::{build_safe_path, is_valid_identifier};

const ID_SUFFIX_LEN: usize = 12;
const EVENTS_FILE: &str = "events.jsonl";

/// What caused a job to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TriggerType {
    Manual,
    Schedule,
    /// Inbound chat message; carries the platform name, e.g. `chat-slack`.
    Chat(String),
    Fork,
    Hook,
}

impl From<TriggerType> for String {
    fn from(t: TriggerType) -> String {
        match t {
            TriggerType::Manual => "manual".to_string(),
            TriggerType::Schedule => "schedule".to_string(),
            TriggerType::Chat(platform) => format!("chat-{}", platform),
            TriggerType::Fork => "fork".to_string(),
            TriggerType::Hook => "hook".to_string(),
        }
    }
}

impl TryFrom<String> for TriggerType {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.as_str() {
            "manual" => Ok(TriggerType::Manual),
            "schedule" => Ok(TriggerType::Schedule),
            "fork" => Ok(TriggerType::Fork),
            "hook" => Ok(TriggerType::Hook),
            other => match other.strip_prefix("chat-") {
                Some(platform) if !platform.is_empty() => {
                    Ok(TriggerType::Chat(platform.to_string()))
                }
                _ => Err(format!("unknown trigger type: {}", other)),
            },
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from(self.clone()))
    }
}

/// Job lifecycle status. Never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    /// True when moving to `next` would not regress the lifecycle.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        next.rank() >= self.rank()
    }
}

/// Token usage attached to an upstream assistant/result message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Provider context window, when the message exposes it.
    pub context_window: Option<u64>,
}

/// One structured event in a job's output log.
///
/// Serialization is line-oriented and append-only so a failure mid-write
/// never corrupts previously persisted events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutputEvent {
    System {
        #[serde(skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default)]
        partial: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    ToolUse {
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<serde_json::Value>,
    },
    ToolResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        success: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
}

impl JobOutputEvent {
    /// One human-readable line for the optional `output.log`.
    pub fn format_line(&self) -> String {
        match self {
            JobOutputEvent::System { subtype, content } => format!(
                "[system{}] {}",
                subtype
                    .as_deref()
                    .map(|s| format!(":{}", s))
                    .unwrap_or_default(),
                content.as_deref().unwrap_or("")
            ),
            JobOutputEvent::Assistant {
                content, partial, ..
            } => {
                if *partial {
                    format!("[assistant…] {}", content.as_deref().unwrap_or(""))
                } else {
                    format!("[assistant] {}", content.as_deref().unwrap_or(""))
                }
            }
            JobOutputEvent::ToolUse {
                tool_name, input, ..
            } => format!(
                "[tool_use] {} {}",
                tool_name,
                input
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            ),
            JobOutputEvent::ToolResult { result, error, .. } => match error {
                Some(err) => format!("[tool_result] error: {}", err),
                None => format!("[tool_result] {}", result.as_deref().unwrap_or("")),
            },
            JobOutputEvent::Error { message, code, .. } => format!(
                "[error{}] {}",
                code.as_deref()
                    .map(|c| format!(":{}", c))
                    .unwrap_or_default(),
                message
            ),
        }
    }
}

/// Record of one agent turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub agent: String,
    pub trigger_type: TriggerType,
    pub status: JobStatus,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<String>,
    /// Upstream session ID, as eventually learned from the provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub output_file: PathBuf,
}

/// Fields a job executor may update after creation.
#[derive(Debug, Default, Clone)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub session_id: Option<String>,
    pub summary: Option<String>,
    pub exit_reason: Option<ExitReason>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// New-job parameters.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub agent: String,
    pub trigger_type: TriggerType,
    pub prompt: String,
    pub schedule_name: Option<String>,
    pub forked_from: Option<String>,
}

/// Filesystem-backed job store under `<state>/jobs/`.
#[derive(Debug, Clone)]
pub struct JobStore {
    jobs_dir: PathBuf,
}

impl JobStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            jobs_dir: state_dir.join("jobs"),
        }
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    /// Allocate an ID, create the job directory, and persist the record.
    ///
    /// Nothing is touched on disk until the agent name has passed
    /// identifier validation.
    pub async fn create_job(&self, new: NewJob) -> Result<Job> {
        if !is_valid_identifier(&new.agent) {
            return Err(FleetError::path_traversal(format!(
                "invalid agent name: {:?}",
                new.agent
            )));
        }

        let id = generate_job_id();
        let job_dir = build_safe_path(&self.jobs_dir, &[&id], None)?;
        tokio::fs::create_dir_all(&job_dir).await?;

        let job = Job {
            id: id.clone(),
            agent: new.agent,
            trigger_type: new.trigger_type,
            status: JobStatus::Pending,
            prompt: new.prompt,
            schedule_name: new.schedule_name,
            forked_from: new.forked_from,
            session_id: None,
            summary: None,
            exit_reason: None,
            started_at: Utc::now(),
            finished_at: None,
            output_file: job_dir.join(EVENTS_FILE),
        };

        atomic_write_json(&job_dir.join("job.json"), &job).await?;
        info!(job_id = %id, agent = %job.agent, trigger = %job.trigger_type, "job created");
        Ok(job)
    }

    /// Load a job record.
    pub async fn get_job(&self, id: &str) -> Result<Job> {
        let path = build_safe_path(&self.jobs_dir, &[id], None)?.join("job.json");
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| FleetError::Job {
                job_id: id.to_string(),
                message: "job record not found".to_string(),
            })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply an update, enforcing status monotonicity.
    pub async fn update_job(&self, id: &str, update: JobUpdate) -> Result<Job> {
        let mut job = self.get_job(id).await?;

        if let Some(status) = update.status {
            if !job.status.can_advance_to(status) {
                return Err(FleetError::Job {
                    job_id: id.to_string(),
                    message: format!(
                        "illegal status transition {:?} -> {:?}",
                        job.status, status
                    ),
                });
            }
            job.status = status;
        }
        if update.session_id.is_some() {
            job.session_id = update.session_id;
        }
        if update.summary.is_some() {
            job.summary = update.summary;
        }
        if update.exit_reason.is_some() {
            job.exit_reason = update.exit_reason;
        }
        if update.finished_at.is_some() {
            job.finished_at = update.finished_at;
        }

        let path = build_safe_path(&self.jobs_dir, &[id], None)?.join("job.json");
        atomic_write_json(&path, &job).await?;
        debug!(job_id = %id, status = ?job.status, "job updated");
        Ok(job)
    }

    /// Append one structured event to the job's line-delimited log.
    ///
    /// Opened for exclusive append per write so concurrent appenders never
    /// interleave within a line. Callers treat failures as non-fatal.
    pub async fn append_job_output(&self, id: &str, event: &JobOutputEvent) -> Result<()> {
        let path = self.get_job_output_path(id)?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Path of the structured event log for a job.
    pub fn get_job_output_path(&self, id: &str) -> Result<PathBuf> {
        Ok(build_safe_path(&self.jobs_dir, &[id], None)?.join(EVENTS_FILE))
    }

    /// Read back all persisted events for a job, skipping torn lines.
    pub async fn read_job_output(&self, id: &str) -> Result<Vec<JobOutputEvent>> {
        let path = self.get_job_output_path(id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => return Ok(Vec::new()),
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// List all job IDs, newest first by ID ordering.
    pub async fn list_jobs(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.jobs_dir).await {
            Ok(e) => e,
            Err(_) => return Ok(ids),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_valid_identifier(&name) {
                ids.push(name);
            }
        }
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }
}

/// `YYYY-MM-DD-<random>` with an alphanumeric suffix long enough that
/// daily collisions are negligible.
fn generate_job_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}-{}", Utc::now().format("%Y-%m-%d"), suffix)
}
