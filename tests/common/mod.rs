//! Shared test doubles for the integration suites.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use ccfleet::config::{AgentConfig, RuntimeKind};
use ccfleet::error::FleetError;
use ccfleet::executor::{JobExecutor, RunnerResult, TriggerOptions, TurnTrigger};
use ccfleet::runtime::{AgentRuntime, ExecutionRequest, MessageStream};
use ccfleet::session::AgentSessionStore;

/// Initialize tracing once per test binary; `RUST_LOG` controls verbosity.
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// What one scripted invocation should yield.
pub enum Step {
    Msg(Value),
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub resume: Option<String>,
    pub fork: bool,
    pub prompt: String,
}

/// Records every execution request and plays back scripted streams in
/// invocation order. When the scripts run out it falls back to a default
/// success stream so late turns never hang a test.
pub struct ScriptedRuntime {
    calls: Arc<Mutex<Vec<CallRecord>>>,
    scripts: Mutex<VecDeque<Vec<Step>>>,
}

impl ScriptedRuntime {
    pub fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            scripts: Mutex::new(scripts.into()),
        })
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::InProcess
    }

    async fn execute(&self, request: ExecutionRequest) -> ccfleet::error::Result<MessageStream> {
        self.calls.lock().unwrap().push(CallRecord {
            resume: request.resume.clone(),
            fork: request.fork,
            prompt: request.prompt.clone(),
        });

        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| success_script("S-default"));

        let (tx, rx) = mpsc::channel(16);
        let agent = request.agent.name.clone();
        tokio::spawn(async move {
            for step in steps {
                let item = match step {
                    Step::Msg(value) => Ok(value),
                    Step::Fail(message) => Err(FleetError::runner_stream(&agent, message)),
                };
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// init → assistant (with usage) → result, all under `session_id`.
pub fn success_script(session_id: &str) -> Vec<Step> {
    vec![
        Step::Msg(json!({"type": "system", "subtype": "init", "session_id": session_id})),
        Step::Msg(json!({
            "type": "assistant",
            "message": {"content": "working on it"},
            "usage": {"input_tokens": 100, "output_tokens": 10, "context_window": 200000}
        })),
        Step::Msg(json!({"type": "result", "result": "all done", "session_id": session_id})),
    ]
}

/// Same shape with explicit usage numbers.
pub fn usage_script(session_id: &str, input: u64, output: u64) -> Vec<Step> {
    vec![
        Step::Msg(json!({"type": "system", "subtype": "init", "session_id": session_id})),
        Step::Msg(json!({
            "type": "assistant",
            "message": {"content": format!("reply at {} tokens", input)},
            "usage": {"input_tokens": input, "output_tokens": output, "context_window": 200000}
        })),
        Step::Msg(json!({"type": "result", "result": "done", "session_id": session_id})),
    ]
}

/// Minimal trigger: a real executor over a fixed agent set, no hooks.
pub struct DirectTrigger {
    pub executor: JobExecutor,
    pub agents: HashMap<String, AgentConfig>,
}

impl DirectTrigger {
    pub fn new(
        state_dir: &std::path::Path,
        runtime: Arc<ScriptedRuntime>,
        agents: Vec<AgentConfig>,
    ) -> Self {
        let mut runtimes: HashMap<RuntimeKind, Arc<dyn AgentRuntime>> = HashMap::new();
        runtimes.insert(RuntimeKind::InProcess, runtime);
        Self {
            executor: JobExecutor::new(
                ccfleet::job::JobStore::new(state_dir),
                AgentSessionStore::new(state_dir),
                runtimes,
            ),
            agents: agents.into_iter().map(|a| (a.name.clone(), a)).collect(),
        }
    }
}

#[async_trait]
impl TurnTrigger for DirectTrigger {
    async fn trigger(
        &self,
        agent_name: &str,
        options: TriggerOptions,
    ) -> ccfleet::error::Result<RunnerResult> {
        let agent = self
            .agents
            .get(agent_name)
            .ok_or_else(|| FleetError::configuration(format!("unknown agent {}", agent_name)))?;
        self.executor.run(agent, options).await
    }
}
