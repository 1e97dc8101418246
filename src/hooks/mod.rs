//! Post-run hooks.
//!
//! After a job finishes, its agent's hooks run in declared order: shell
//! commands (argument-array form, bounded timeout, capped output) and
//! chat posts of the job summary. A failing hook is logged and never fails
//! the originating job. Each hook may carry a `when` condition over job
//! metadata; conditions that fail to evaluate skip the hook.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{AgentConfig, HookConfig};
use crate::error::{ExitReason, Result};
use crate::executor::RunnerResult;
use crate::job::JobStatus;

/// Outbound chat surface hooks post through. Implemented by the chat
/// manager; absent when no chat platform is connected.
#[async_trait]
pub trait ChatPoster: Send + Sync {
    async fn post_message(&self, platform: &str, channel: &str, text: &str) -> Result<()>;
}

/// Job facts `when` conditions evaluate against.
#[derive(Debug, Clone)]
pub struct JobMetadata {
    fields: HashMap<&'static str, String>,
    summary: Option<String>,
    job_id: String,
}

impl JobMetadata {
    pub fn from_result(agent: &AgentConfig, result: &RunnerResult) -> Self {
        let mut fields = HashMap::new();
        fields.insert("agent", agent.name.clone());
        fields.insert(
            "status",
            match result.status {
                JobStatus::Pending => "pending",
                JobStatus::Running => "running",
                JobStatus::Completed => "completed",
                JobStatus::Failed => "failed",
            }
            .to_string(),
        );
        fields.insert(
            "exit_reason",
            match result.exit_reason {
                ExitReason::Success => "success",
                ExitReason::Error => "error",
                ExitReason::Timeout => "timeout",
                ExitReason::Cancelled => "cancelled",
                ExitReason::MaxTurns => "max_turns",
            }
            .to_string(),
        );
        fields.insert("job_id", result.job_id.clone());
        Self {
            fields,
            summary: result.summary.clone(),
            job_id: result.job_id.clone(),
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Runs an agent's `after_run` hooks.
pub struct HookExecutor {
    poster: Option<Arc<dyn ChatPoster>>,
}

impl HookExecutor {
    pub fn new(poster: Option<Arc<dyn ChatPoster>>) -> Self {
        Self { poster }
    }

    /// Run every hook in order. Never fails; failures are logged per hook.
    pub async fn run_after_job(&self, agent: &AgentConfig, meta: &JobMetadata) {
        for hook in &agent.hooks.after_run {
            if let Some(condition) = hook.when() {
                match evaluate_condition(condition, meta) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(agent = %agent.name, hook = %hook.describe(), "hook skipped by condition");
                        continue;
                    }
                    Err(e) => {
                        warn!(agent = %agent.name, hook = %hook.describe(), error = %e, "hook condition failed to evaluate, skipping");
                        continue;
                    }
                }
            }

            if let Err(e) = self.run_hook(hook, meta).await {
                warn!(agent = %agent.name, hook = %hook.describe(), error = %e, "hook failed");
            }
        }
    }

    async fn run_hook(&self, hook: &HookConfig, meta: &JobMetadata) -> Result<()> {
        match hook {
            HookConfig::Shell {
                command,
                timeout_secs,
                max_output_bytes,
                ..
            } => {
                run_shell_hook(command, *timeout_secs, *max_output_bytes, meta).await
            }
            HookConfig::ChatPost {
                platform, channel, ..
            } => {
                let Some(poster) = &self.poster else {
                    return Err(crate::error::FleetError::Hook {
                        hook: hook.describe(),
                        message: format!("no chat connection for platform {}", platform),
                    });
                };
                let text = match &meta.summary {
                    Some(summary) => format!("Job `{}` finished: {}", meta.job_id, summary),
                    None => format!("Job `{}` finished.", meta.job_id),
                };
                poster.post_message(platform, channel, &text).await
            }
        }
    }
}

async fn run_shell_hook(
    command: &[String],
    timeout_secs: u64,
    max_output_bytes: usize,
    meta: &JobMetadata,
) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        return Err(crate::error::FleetError::Hook {
            hook: "shell".to_string(),
            message: "empty command".to_string(),
        });
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &meta.fields {
        cmd.env(format!("CCFLEET_{}", key.to_uppercase()), value);
    }
    if let Some(summary) = &meta.summary {
        cmd.env("CCFLEET_SUMMARY", summary);
    }

    let output = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output())
        .await
        .map_err(|_| crate::error::FleetError::Hook {
            hook: program.clone(),
            message: format!("timed out after {}s", timeout_secs),
        })?
        .map_err(|e| crate::error::FleetError::Hook {
            hook: program.clone(),
            message: format!("failed to execute: {}", e),
        })?;

    let mut stdout = output.stdout;
    stdout.truncate(max_output_bytes);
    info!(
        hook = %program,
        exit = ?output.status.code(),
        output = %String::from_utf8_lossy(&stdout).trim(),
        "shell hook finished"
    );

    if output.status.success() {
        Ok(())
    } else {
        let mut stderr = output.stderr;
        stderr.truncate(max_output_bytes);
        Err(crate::error::FleetError::Hook {
            hook: program.clone(),
            message: format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&stderr).trim()
            ),
        })
    }
}

/// Evaluate `key == 'value'` / `key != 'value'` against job metadata.
fn evaluate_condition(expr: &str, meta: &JobMetadata) -> std::result::Result<bool, String> {
    let (key, op, raw_value) = if let Some((key, value)) = expr.split_once("==") {
        (key, true, value)
    } else if let Some((key, value)) = expr.split_once("!=") {
        (key, false, value)
    } else {
        return Err(format!("unsupported condition: {:?}", expr));
    };

    let key = key.trim();
    let value = raw_value.trim().trim_matches('\'').trim_matches('"');

    let actual = meta
        .get(key)
        .ok_or_else(|| format!("unknown metadata key: {:?}", key))?;

    Ok((actual == value) == op)
}
