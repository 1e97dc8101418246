//! Time-based triggers.
//!
//! Each schedule runs in its own task. Interval schedules use a tokio
//! interval with skipped missed ticks; cron schedules sleep until the next
//! upcoming instant computed after every fire. Fires missed while the
//! process was down are not backfilled.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AgentConfig, RuntimeKind, ScheduleConfig};
use crate::error::{FleetError, Result};
use crate::executor::{TriggerOptions, TurnTrigger};
use crate::job::TriggerType;
use crate::session::{AgentSessionStore, LoadOptions};

/// Spawns and supervises one task per configured schedule.
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Validate every cron expression before anything is spawned.
    pub fn validate(agents: &[AgentConfig]) -> Result<()> {
        for agent in agents {
            for schedule in &agent.schedules {
                if let Some(expr) = &schedule.cron {
                    Schedule::from_str(expr).map_err(|e| {
                        FleetError::configuration(format!(
                            "agent {:?}: invalid cron expression {:?}: {}",
                            agent.name, expr, e
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Start all schedule tasks. The returned scheduler owns them.
    pub fn start(
        agents: &[AgentConfig],
        trigger: Arc<dyn TurnTrigger>,
        sessions: AgentSessionStore,
        cancel: CancellationToken,
    ) -> Self {
        let mut handles = Vec::new();

        for agent in agents {
            for schedule in &agent.schedules {
                let handle = tokio::spawn(run_schedule(
                    agent.clone(),
                    schedule.clone(),
                    trigger.clone(),
                    sessions.clone(),
                    cancel.child_token(),
                ));
                handles.push(handle);
            }
        }

        if !handles.is_empty() {
            info!(schedules = handles.len(), "scheduler started");
        }

        Self { handles, cancel }
    }

    /// Cancel all schedule tasks and wait for them to acknowledge.
    pub async fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_schedule(
    agent: AgentConfig,
    schedule: ScheduleConfig,
    trigger: Arc<dyn TurnTrigger>,
    sessions: AgentSessionStore,
    cancel: CancellationToken,
) {
    match (&schedule.interval_secs, &schedule.cron) {
        (Some(secs), _) => {
            let mut ticker = tokio::time::interval(Duration::from_secs((*secs).max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; schedules fire after
            // their period, not at startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        fire(&agent, &schedule, &trigger, &sessions).await;
                    }
                }
            }
        }
        (None, Some(expr)) => {
            let Ok(parsed) = Schedule::from_str(expr) else {
                error!(agent = %agent.name, schedule = %schedule.name, "cron expression did not parse, schedule disabled");
                return;
            };

            loop {
                let Some(next) = parsed.upcoming(Utc).next() else {
                    warn!(agent = %agent.name, schedule = %schedule.name, "cron schedule has no upcoming fire, stopping");
                    break;
                };
                let wait = (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(0));

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        fire(&agent, &schedule, &trigger, &sessions).await;
                    }
                }
            }
        }
        (None, None) => {
            warn!(agent = %agent.name, schedule = %schedule.name, "schedule has neither interval nor cron, ignoring");
        }
    }
}

/// One fire: an independent job; session sharing is per-schedule policy.
async fn fire(
    agent: &AgentConfig,
    schedule: &ScheduleConfig,
    trigger: &Arc<dyn TurnTrigger>,
    sessions: &AgentSessionStore,
) {
    let resume = if schedule.fresh_session {
        None
    } else {
        let runtime = if agent.uses_container() {
            RuntimeKind::Container
        } else {
            RuntimeKind::InProcess
        };
        let opts = LoadOptions {
            timeout: Some(Duration::from_secs(agent.session.timeout_secs)),
            runtime: Some(runtime),
        };
        match sessions.load(&agent.name, opts).await {
            Ok(session) => session.map(|s| s.session_id),
            Err(e) => {
                warn!(agent = %agent.name, error = %e, "session lookup failed before schedule fire");
                None
            }
        }
    };

    info!(agent = %agent.name, schedule = %schedule.name, resuming = resume.is_some(), "schedule fired");

    let options = TriggerOptions {
        prompt: schedule.prompt.clone(),
        trigger_type: Some(TriggerType::Schedule),
        resume,
        schedule_name: Some(schedule.name.clone()),
        write_output_log: true,
        ..Default::default()
    };

    match trigger.trigger(&agent.name, options).await {
        Ok(result) => {
            info!(
                agent = %agent.name,
                schedule = %schedule.name,
                job_id = %result.job_id,
                status = ?result.status,
                "scheduled job finished"
            );
        }
        Err(e) => {
            error!(agent = %agent.name, schedule = %schedule.name, error = %e, "scheduled job failed to run");
        }
    }
}
