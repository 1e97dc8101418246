//! Fleet lifecycle and the single trigger entry point.
//!
//! The fleet owns the resolved agents, the runtimes, the scheduler, the
//! chat managers, and the hook executor. Agents are loaded once at
//! initialization and never change while running; reconfiguration is a
//! restart. Every subsystem — manual callers, schedules, chat — starts
//! turns through [`Fleet::trigger`], which is the only path into the job
//! executor.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chat::{ChatAdapter, ChatManager};
use crate::config::{FleetConfig, RuntimeKind};
use crate::error::{FleetError, Result};
use crate::executor::{JobExecutor, RunnerResult, TriggerOptions, TurnTrigger};
use crate::hooks::{ChatPoster, HookExecutor, JobMetadata};
use crate::job::{JobStatus, JobStore};
use crate::runtime::container::ContainerRuntime;
use crate::runtime::in_process::InProcessRuntime;
use crate::runtime::AgentRuntime;
use crate::scheduler::Scheduler;
use crate::session::{AgentSessionStore, LoadOptions};

/// How long `stop` waits for in-flight work to acknowledge cancellation.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Shared trigger target: agents, executor, and post-run hooks.
pub struct FleetCore {
    agents: HashMap<String, crate::config::AgentConfig>,
    executor: JobExecutor,
    hooks: OnceLock<Arc<HookExecutor>>,
}

#[async_trait]
impl TurnTrigger for FleetCore {
    async fn trigger(&self, agent_name: &str, options: TriggerOptions) -> Result<RunnerResult> {
        let agent = self.agents.get(agent_name).ok_or_else(|| {
            FleetError::configuration(format!("unknown agent: {:?}", agent_name))
        })?;

        let result = self.executor.run(agent, options).await?;

        if result.status == JobStatus::Completed && !agent.hooks.after_run.is_empty() {
            if let Some(hooks) = self.hooks.get() {
                let meta = JobMetadata::from_result(agent, &result);
                hooks.run_after_job(agent, &meta).await;
            }
        }

        Ok(result)
    }
}

/// Routes chat-post hooks to whichever manager owns the platform.
struct MultiPoster {
    managers: Vec<ChatManager>,
}

#[async_trait]
impl ChatPoster for MultiPoster {
    async fn post_message(&self, platform: &str, channel: &str, text: &str) -> Result<()> {
        for manager in &self.managers {
            match manager.post_message(platform, channel, text).await {
                Ok(()) => return Ok(()),
                Err(FleetError::ChatPlatform { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::Hook {
            hook: format!("{}:{}", platform, channel),
            message: format!("no chat connection for platform {}", platform),
        })
    }
}

/// A running fleet.
pub struct Fleet {
    config: FleetConfig,
    core: Arc<FleetCore>,
    chat_managers: Vec<ChatManager>,
    scheduler: Option<Scheduler>,
    chat_handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    started: bool,
}

impl Fleet {
    /// Load agents, construct stores, runtimes, chat managers, scheduler,
    /// and hooks. Nothing long-running starts until [`Fleet::start`].
    pub async fn initialize(
        config: FleetConfig,
        adapters: Vec<Arc<dyn ChatAdapter>>,
    ) -> Result<Self> {
        config.validate()?;
        Scheduler::validate(&config.agents)?;

        let state_dir = config.state_root();
        tokio::fs::create_dir_all(&state_dir).await?;

        let job_store = JobStore::new(&state_dir);
        let sessions = AgentSessionStore::new(&state_dir);

        // Cleanup-on-startup: stale agent sessions are removed here so no
        // turn ever resumes one.
        for agent in &config.agents {
            let opts = LoadOptions {
                timeout: Some(Duration::from_secs(agent.session.timeout_secs)),
                runtime: None,
            };
            if let Err(e) = sessions.load(&agent.name, opts).await {
                warn!(agent = %agent.name, error = %e, "startup session check failed");
            }
        }

        let mut runtimes: HashMap<RuntimeKind, Arc<dyn AgentRuntime>> = HashMap::new();
        runtimes.insert(
            RuntimeKind::InProcess,
            Arc::new(InProcessRuntime::default()),
        );
        if config.agents.iter().any(|a| a.uses_container()) {
            let bridge_host = std::env::var("CCFLEET_BRIDGE_HOST")
                .unwrap_or_else(|_| "host.docker.internal".to_string());
            let container = ContainerRuntime::new(config.docker.clone(), bridge_host).await?;
            runtimes.insert(RuntimeKind::Container, Arc::new(container));
        }

        let executor = JobExecutor::new(job_store, sessions, runtimes);
        let core = Arc::new(FleetCore {
            agents: config
                .agents
                .iter()
                .map(|a| (a.name.clone(), a.clone()))
                .collect(),
            executor,
            hooks: OnceLock::new(),
        });

        let cancel = CancellationToken::new();
        let mut chat_managers = Vec::new();
        for adapter in adapters {
            let manager = ChatManager::new(
                &state_dir,
                &config.agents,
                adapter.clone(),
                core.clone() as Arc<dyn TurnTrigger>,
                cancel.child_token(),
            )?;
            if manager.has_routes() {
                chat_managers.push(manager);
            } else {
                info!(platform = %adapter.platform(), "no channels bound, adapter not started");
            }
        }

        let poster: Option<Arc<dyn ChatPoster>> = if chat_managers.is_empty() {
            None
        } else {
            Some(Arc::new(MultiPoster {
                managers: chat_managers.clone(),
            }))
        };
        let _ = core.hooks.set(Arc::new(HookExecutor::new(poster)));

        info!(
            fleet = %config.name,
            agents = config.agents.len(),
            chat_platforms = chat_managers.len(),
            "fleet initialized"
        );

        Ok(Self {
            config,
            core,
            chat_managers,
            scheduler: None,
            chat_handles: Vec::new(),
            cancel,
            started: false,
        })
    }

    /// Spawn the long-running loops: schedules and chat connections.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        self.scheduler = Some(Scheduler::start(
            &self.config.agents,
            self.core.clone() as Arc<dyn TurnTrigger>,
            self.core.executor.sessions().clone(),
            self.cancel.child_token(),
        ));

        for manager in &self.chat_managers {
            let handle = manager.start().await?;
            self.chat_handles.push(handle);
        }

        info!(fleet = %self.config.name, "fleet started");
        Ok(())
    }

    /// Cooperative shutdown: cancel everything, then wait up to the
    /// deadline for in-flight work to acknowledge.
    pub async fn stop(&mut self) {
        info!(fleet = %self.config.name, "fleet stopping");
        self.cancel.cancel();

        for manager in &self.chat_managers {
            manager.stop().await;
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop().await;
        }

        for handle in self.chat_handles.drain(..) {
            match tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await {
                Ok(_) => {}
                Err(_) => warn!("chat loop did not stop within deadline, abandoning"),
            }
        }

        self.started = false;
        info!(fleet = %self.config.name, "fleet stopped");
    }

    /// Start one turn. The sole entry point into the job executor.
    pub async fn trigger(
        &self,
        agent_name: &str,
        options: TriggerOptions,
    ) -> Result<RunnerResult> {
        self.core.trigger(agent_name, options).await
    }

    /// Fork a finished job's session into a new turn. The original session
    /// stays usable; the provider branches the conversation.
    pub async fn fork(&self, job_id: &str, prompt: String) -> Result<RunnerResult> {
        let job = self.job_store().get_job(job_id).await?;
        let session_id = job.session_id.clone().ok_or_else(|| FleetError::Job {
            job_id: job_id.to_string(),
            message: "job recorded no session to fork".to_string(),
        })?;

        self.trigger(
            &job.agent,
            TriggerOptions {
                prompt,
                trigger_type: Some(crate::job::TriggerType::Fork),
                resume: Some(session_id),
                fork: true,
                forked_from: Some(job_id.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn job_store(&self) -> &JobStore {
        self.core.executor.job_store()
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.config.agents.iter().map(|a| a.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use tempfile::TempDir;

    fn fleet_config(dir: &TempDir, agents: Vec<AgentConfig>) -> FleetConfig {
        FleetConfig {
            name: "test-fleet".to_string(),
            state_dir: Some(dir.path().to_path_buf()),
            docker: Default::default(),
            agents,
        }
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config = fleet_config(&dir, vec![AgentConfig::named("bad name")]);
        assert!(Fleet::initialize(config, Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_trigger_unknown_agent() {
        let dir = TempDir::new().unwrap();
        let config = fleet_config(&dir, vec![AgentConfig::named("a1")]);
        let fleet = Fleet::initialize(config, Vec::new()).await.unwrap();

        let err = fleet
            .trigger("nope", TriggerOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_start_stop_without_work() {
        let dir = TempDir::new().unwrap();
        let config = fleet_config(&dir, vec![AgentConfig::named("a1")]);
        let mut fleet = Fleet::initialize(config, Vec::new()).await.unwrap();
        fleet.start().await.unwrap();
        fleet.stop().await;
    }
}
