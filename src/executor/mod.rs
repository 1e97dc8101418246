//! The job executor drives one agent turn end-to-end.
//!
//! This is the single place where the per-thread session-trust rule lives:
//! when the caller supplies a resume session that differs from the
//! agent-level record, the caller is trusted verbatim — it owns the mapping
//! for its conversation and the agent-level record is irrelevant. Only when
//! the caller's session *is* the agent-level session do working-directory
//! and runtime-context validation apply.
//!
//! The only retry in the system also lives here: one re-execution with a
//! fresh session after the provider acknowledges that the resumed session
//! no longer exists. Every other failure fails the job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, RuntimeKind};
use crate::error::{classify_exit_reason, ExitReason, FleetError, Result};
use crate::job::{Job, JobOutputEvent, JobStatus, JobStore, JobUpdate, NewJob, TriggerType};
use crate::processor::{extract_summary, process, ProcessedEvent};
use crate::runtime::{AgentRuntime, ExecutionRequest, InjectedToolServer};
use crate::session::{
    is_session_expired_error, validate_runtime_context, validate_working_directory,
    AgentSessionStore, AgentSessionUpdate, LoadOptions, UsageDelta,
};

/// Entry point every subsystem uses to start a turn. Implemented by the
/// fleet; mocked in tests.
#[async_trait::async_trait]
pub trait TurnTrigger: Send + Sync {
    async fn trigger(&self, agent_name: &str, options: TriggerOptions) -> Result<RunnerResult>;
}

/// Invoked for every processed upstream event.
pub type MessageCallback = Arc<dyn Fn(&ProcessedEvent) + Send + Sync>;
/// Invoked with the job ID before execution starts.
pub type JobCreatedCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Invoked with raw usage deltas; the conversation store accumulates them.
pub type UsageCallback = Arc<dyn Fn(UsageDelta) + Send + Sync>;

/// Caller-supplied parameters for one turn.
#[derive(Clone, Default)]
pub struct TriggerOptions {
    pub prompt: String,
    pub trigger_type: Option<TriggerType>,
    /// Upstream session to continue. `None` means a fresh session; callers
    /// must use `None` to mean "no resume", never a sentinel value.
    pub resume: Option<String>,
    pub fork: bool,
    pub schedule_name: Option<String>,
    pub forked_from: Option<String>,
    /// Also write a human-readable `output.log` next to the event log.
    pub write_output_log: bool,
    pub cancel: Option<CancellationToken>,
    pub on_message: Option<MessageCallback>,
    pub on_job_created: Option<JobCreatedCallback>,
    pub on_usage: Option<UsageCallback>,
    pub injected_tool_servers: Vec<InjectedToolServer>,
}

/// Outcome of one turn, returned to the triggering subsystem.
#[derive(Debug, Clone)]
pub struct RunnerResult {
    pub job_id: String,
    pub status: JobStatus,
    pub exit_reason: ExitReason,
    pub session_id: Option<String>,
    pub summary: Option<String>,
    pub duration: Duration,
    /// Tokens observed across the whole turn.
    pub usage: UsageDelta,
}

/// What one streaming pass produced.
struct StreamOutcome {
    session_id: Option<String>,
    last_assistant: Option<String>,
    terminal: Option<serde_json::Value>,
    usage: UsageDelta,
    error: Option<FleetError>,
}

/// Executes jobs against the configured runtimes.
pub struct JobExecutor {
    job_store: JobStore,
    sessions: AgentSessionStore,
    runtimes: HashMap<RuntimeKind, Arc<dyn AgentRuntime>>,
}

impl JobExecutor {
    pub fn new(
        job_store: JobStore,
        sessions: AgentSessionStore,
        runtimes: HashMap<RuntimeKind, Arc<dyn AgentRuntime>>,
    ) -> Self {
        Self {
            job_store,
            sessions,
            runtimes,
        }
    }

    pub fn job_store(&self) -> &JobStore {
        &self.job_store
    }

    pub fn sessions(&self) -> &AgentSessionStore {
        &self.sessions
    }

    fn runtime_for(&self, agent: &AgentConfig) -> Result<Arc<dyn AgentRuntime>> {
        let kind = if agent.uses_container() {
            RuntimeKind::Container
        } else {
            RuntimeKind::InProcess
        };
        self.runtimes.get(&kind).cloned().ok_or_else(|| {
            FleetError::runner_init(
                &agent.name,
                format!("no {} runtime registered", kind.as_str()),
            )
        })
    }

    /// Run one turn. See the module docs for the state machine.
    pub async fn run(&self, agent: &AgentConfig, options: TriggerOptions) -> Result<RunnerResult> {
        let started = std::time::Instant::now();
        let docker_enabled = agent.docker.as_ref().map(|d| d.enabled).unwrap_or(false);
        let runtime = self.runtime_for(agent)?;

        // Step 1: create the job record; a failure here aborts the turn.
        let job = self
            .job_store
            .create_job(NewJob {
                agent: agent.name.clone(),
                trigger_type: options.trigger_type.clone().unwrap_or(TriggerType::Manual),
                prompt: options.prompt.clone(),
                schedule_name: options.schedule_name.clone(),
                forked_from: options.forked_from.clone(),
            })
            .await?;

        // Step 2: let the caller record the job association up front.
        if let Some(on_created) = &options.on_job_created {
            on_created(&job.id);
        }

        // Step 3: optional human-readable log.
        let mut output_log = if options.write_output_log {
            let path = job.output_file.with_file_name("output.log");
            match tokio::fs::File::create(&path).await {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "could not create output.log");
                    None
                }
            }
        } else {
            None
        };

        // Step 4.
        self.job_store
            .update_job(
                &job.id,
                JobUpdate {
                    status: Some(JobStatus::Running),
                    ..Default::default()
                },
            )
            .await?;

        // Step 5: resolve the session to resume.
        let mut resume = self
            .resolve_resume(agent, options.resume.as_deref(), docker_enabled)
            .await?;

        // Steps 6–7: stream, with a single recoverable-expiry retry.
        let cancel = options.cancel.clone().unwrap_or_default();
        let mut retried = false;
        let outcome = loop {
            let request = ExecutionRequest {
                prompt: options.prompt.clone(),
                agent: agent.clone(),
                job_id: job.id.clone(),
                resume: resume.clone(),
                fork: options.fork,
                cancel: cancel.clone(),
                injected_tool_servers: options.injected_tool_servers.clone(),
            };

            let outcome = match runtime.execute(request).await {
                Ok(stream) => {
                    self.consume_stream(&job, stream, &options, &mut output_log)
                        .await
                }
                Err(e) => StreamOutcome {
                    session_id: None,
                    last_assistant: None,
                    terminal: None,
                    usage: UsageDelta::default(),
                    error: Some(e),
                },
            };

            let expired = outcome
                .error
                .as_ref()
                .map(|e| is_session_expired_error(&e.to_string()))
                .unwrap_or(false);

            if expired && resume.is_some() && !retried {
                retried = true;
                info!(job_id = %job.id, agent = %agent.name, "server-side session expired, retrying fresh");
                if let Err(e) = self.sessions.clear(&agent.name).await {
                    warn!(agent = %agent.name, error = %e, "could not clear expired session");
                }
                let notice = JobOutputEvent::System {
                    subtype: Some("session_expired".to_string()),
                    content: Some(
                        "Session expired on server. Retrying with fresh session.".to_string(),
                    ),
                };
                self.append_best_effort(&job.id, &notice, &mut output_log)
                    .await;
                resume = None;
                continue;
            }

            break outcome;
        };

        // Step 8: finalize exactly once.
        let summary = extract_summary(outcome.terminal.as_ref(), outcome.last_assistant.as_deref());
        let (status, exit_reason) = match &outcome.error {
            None => (JobStatus::Completed, ExitReason::Success),
            Some(e) => (JobStatus::Failed, classify_exit_reason(&e.to_string())),
        };

        self.job_store
            .update_job(
                &job.id,
                JobUpdate {
                    status: Some(status),
                    session_id: outcome.session_id.clone(),
                    summary: summary.clone(),
                    exit_reason: Some(exit_reason),
                    finished_at: Some(Utc::now()),
                },
            )
            .await?;

        // Step 9: session persistence is best-effort.
        if let Some(session_id) = &outcome.session_id {
            let update = AgentSessionUpdate {
                session_id: session_id.clone(),
                mode: Some(agent.permission_mode.as_str().to_string()),
                working_directory: agent.working_directory.clone(),
                runtime_type: if agent.uses_container() {
                    RuntimeKind::Container
                } else {
                    RuntimeKind::InProcess
                },
                docker_enabled,
            };
            if let Err(e) = self.sessions.update(&agent.name, update).await {
                warn!(agent = %agent.name, error = %e, "session persistence failed");
            }
        }

        let duration = started.elapsed();
        info!(
            job_id = %job.id,
            agent = %agent.name,
            status = ?status,
            exit_reason = ?exit_reason,
            duration_ms = duration.as_millis() as u64,
            "job finalized"
        );

        Ok(RunnerResult {
            job_id: job.id,
            status,
            exit_reason,
            session_id: outcome.session_id,
            summary,
            duration,
            usage: outcome.usage,
        })
    }

    /// Apply the per-thread session-trust rule.
    async fn resolve_resume(
        &self,
        agent: &AgentConfig,
        requested: Option<&str>,
        docker_enabled: bool,
    ) -> Result<Option<String>> {
        let Some(requested) = requested else {
            return Ok(None);
        };

        let load_opts = LoadOptions {
            timeout: Some(Duration::from_secs(agent.session.timeout_secs)),
            runtime: None,
        };
        let agent_session = self.sessions.load(&agent.name, load_opts).await?;

        match agent_session {
            // The caller owns a mapping the agent-level record knows nothing
            // about (typically a chat thread). Trust it unchanged and skip
            // agent-level validation entirely.
            None => Ok(Some(requested.to_string())),
            Some(session) if session.session_id != requested => {
                debug!(
                    agent = %agent.name,
                    "caller-supplied resume differs from agent session, trusting caller"
                );
                Ok(Some(requested.to_string()))
            }
            // The caller is resuming the agent-level session itself: the
            // stored context must still hold.
            Some(session) => {
                let wd = validate_working_directory(&session, agent.working_directory.as_deref());
                let runtime_kind = if agent.uses_container() {
                    RuntimeKind::Container
                } else {
                    RuntimeKind::InProcess
                };
                let ctx = validate_runtime_context(&session, runtime_kind, docker_enabled);

                if !wd.valid || !ctx.valid {
                    let reason = wd.message.or(ctx.message).unwrap_or_default();
                    info!(agent = %agent.name, reason = %reason, "agent session invalid, starting fresh");
                    self.sessions.clear(&agent.name).await?;
                    return Ok(None);
                }

                // Refresh before execution so the session cannot expire
                // mid-turn.
                self.sessions.touch(&agent.name).await?;
                Ok(Some(session.session_id))
            }
        }
    }

    /// Consume one runtime stream to its terminal message or error.
    async fn consume_stream(
        &self,
        job: &Job,
        mut stream: crate::runtime::MessageStream,
        options: &TriggerOptions,
        output_log: &mut Option<tokio::fs::File>,
    ) -> StreamOutcome {
        let mut outcome = StreamOutcome {
            session_id: None,
            last_assistant: None,
            terminal: None,
            usage: UsageDelta::default(),
            error: None,
        };

        while let Some(item) = stream.recv().await {
            let value = match item {
                Ok(value) => value,
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            };

            let event = process(&value);

            self.append_best_effort(&job.id, &event.output, output_log)
                .await;

            if let Some(session_id) = &event.session_id {
                outcome.session_id = Some(session_id.clone());
            }

            if let Some(usage) = event.usage {
                outcome.usage.input_tokens += usage.input_tokens;
                outcome.usage.output_tokens += usage.output_tokens;
                if usage.context_window.is_some() {
                    outcome.usage.context_window = usage.context_window;
                }
                if let Some(on_usage) = &options.on_usage {
                    on_usage(usage);
                }
            }

            if let JobOutputEvent::Assistant {
                content: Some(content),
                partial: false,
                ..
            } = &event.output
            {
                outcome.last_assistant = Some(content.clone());
            }

            if let Some(on_message) = &options.on_message {
                on_message(&event);
            }

            if event.is_terminal {
                if let JobOutputEvent::Error { message, code, .. } = &event.output {
                    outcome.error = Some(FleetError::runner_stream(
                        &job.agent,
                        match code {
                            Some(code) => format!("{} ({})", message, code),
                            None => message.clone(),
                        },
                    ));
                } else {
                    outcome.terminal = Some(value);
                }
                break;
            }
        }

        outcome
    }

    /// Output appends never terminate an ongoing turn.
    async fn append_best_effort(
        &self,
        job_id: &str,
        event: &JobOutputEvent,
        output_log: &mut Option<tokio::fs::File>,
    ) {
        if let Err(e) = self.job_store.append_job_output(job_id, event).await {
            warn!(job_id, error = %e, "job output append failed");
        }
        if let Some(file) = output_log {
            let line = format!("{}\n", event.format_line());
            if let Err(e) = file.write_all(line.as_bytes()).await {
                warn!(job_id, error = %e, "output.log write failed");
            }
        }
    }
}
