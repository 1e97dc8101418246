//! Resolved fleet and agent configuration.
//!
//! These types are the already-validated form the orchestrator consumes.
//! Parsing fleet files (YAML, includes, schema checks) happens upstream of
//! this crate; everything here is immutable after fleet load.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{FleetError, Result};
use crate::utils::is_valid_identifier;

/// Permission mode forwarded to the AI provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl PermissionMode {
    /// Provider-facing string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
        }
    }
}

/// How an agent turn is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RuntimeKind {
    #[default]
    #[serde(rename = "in-process")]
    InProcess,
    #[serde(rename = "container")]
    Container,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::InProcess => "in-process",
            RuntimeKind::Container => "container",
        }
    }
}

/// MCP tool-server endpoint: remote URL or spawned command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpServerConfig {
    Url {
        url: String,
    },
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
}

/// Container settings for an agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DockerConfig {
    /// Whether the container runtime is active for this agent.
    #[serde(default)]
    pub enabled: bool,
    /// Image to run; falls back to the fleet-level default.
    pub image: Option<String>,
    /// Memory limit in bytes.
    pub memory: Option<i64>,
    /// Named network. Any custom network name is accepted; `none` is not,
    /// since the agent must reach the provider and the tool bridge.
    pub network: Option<String>,
    /// Host environment variable names passed through into the container.
    #[serde(default)]
    pub env_passthrough: Vec<String>,
    /// Raw host-config override. Only honoured from fleet-level (static)
    /// configuration; a known accepted risk.
    pub host_config: Option<serde_json::Value>,
}

/// Session expiry policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionPolicy {
    /// Idle duration after which a session is considered dead.
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,
}

fn default_session_timeout() -> u64 {
    86_400 // 24h
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout(),
        }
    }
}

/// Channel listening mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    /// Top-level messages must address the bot; thread replies always flow.
    #[default]
    Mention,
    /// Every channel message flows through.
    Auto,
}

/// One bound channel on a chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChannelConfig {
    /// Platform channel identifier.
    pub id: String,
    #[serde(default)]
    pub mode: ChannelMode,
    /// Back-scroll count for auto-mode context building.
    #[serde(default)]
    pub context_messages: usize,
}

/// Per-platform chat bindings for one agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatPlatformConfig {
    #[serde(default)]
    pub channels: Vec<ChatChannelConfig>,
}

/// Time-based trigger for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Identifier-pattern name, recorded on the job.
    pub name: String,
    /// Fixed interval in seconds. Mutually exclusive with `cron`.
    pub interval_secs: Option<u64>,
    /// Cron expression. Mutually exclusive with `interval_secs`.
    pub cron: Option<String>,
    /// Prompt sent on each fire.
    pub prompt: String,
    /// Start a fresh provider session on each fire instead of sharing the
    /// agent-level session. Defaults to sharing.
    #[serde(default)]
    pub fresh_session: bool,
}

/// A post-run side effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookConfig {
    /// Run a command with argument-array form. Never shell-string
    /// concatenation.
    Shell {
        command: Vec<String>,
        #[serde(default = "default_hook_timeout")]
        timeout_secs: u64,
        #[serde(default = "default_hook_output_cap")]
        max_output_bytes: usize,
        #[serde(default)]
        when: Option<String>,
    },
    /// Post the job summary to a chat channel.
    ChatPost {
        platform: String,
        channel: String,
        #[serde(default)]
        when: Option<String>,
    },
}

fn default_hook_timeout() -> u64 {
    60
}

fn default_hook_output_cap() -> usize {
    64 * 1024
}

impl HookConfig {
    pub fn when(&self) -> Option<&str> {
        match self {
            HookConfig::Shell { when, .. } | HookConfig::ChatPost { when, .. } => when.as_deref(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            HookConfig::Shell { command, .. } => {
                format!("shell:{}", command.first().map(String::as_str).unwrap_or(""))
            }
            HookConfig::ChatPost {
                platform, channel, ..
            } => format!("{}:{}", platform, channel),
        }
    }
}

/// Hooks attached to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HooksConfig {
    #[serde(default)]
    pub after_run: Vec<HookConfig>,
}

/// Immutable-after-load description of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable name; unique within a fleet, identifier pattern, used in paths.
    pub name: String,
    /// Absolute host path the agent sees as its root.
    pub working_directory: Option<PathBuf>,
    /// Model passed through to the provider.
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    /// Bash commands the agent may run; each expands to `Bash(cmd *)`.
    #[serde(default)]
    pub bash_allow: Vec<String>,
    /// Bash patterns the agent may never run; each expands to `Bash(pattern)`.
    #[serde(default)]
    pub bash_deny: Vec<String>,
    /// Custom system prompt; absent means the provider's "default" preset.
    pub system_prompt: Option<String>,
    /// Explicit value wins; defaults derived from `working_directory`.
    pub setting_sources: Option<Vec<String>>,
    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub session: SessionPolicy,
    #[serde(default)]
    pub runtime: RuntimeKind,
    pub docker: Option<DockerConfig>,
    #[serde(default)]
    pub chat: HashMap<String, ChatPlatformConfig>,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
    #[serde(default)]
    pub hooks: HooksConfig,
}

impl AgentConfig {
    /// Minimal agent used pervasively in tests.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            working_directory: None,
            model: None,
            permission_mode: PermissionMode::default(),
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            bash_allow: Vec::new(),
            bash_deny: Vec::new(),
            system_prompt: None,
            setting_sources: None,
            mcp_servers: HashMap::new(),
            max_turns: None,
            session: SessionPolicy::default(),
            runtime: RuntimeKind::default(),
            docker: None,
            chat: HashMap::new(),
            schedules: Vec::new(),
            hooks: HooksConfig::default(),
        }
    }

    /// Effective setting sources: explicit value wins, otherwise `["project"]`
    /// when a working directory exists and `[]` when it doesn't.
    pub fn effective_setting_sources(&self) -> Vec<String> {
        match &self.setting_sources {
            Some(explicit) => explicit.clone(),
            None if self.working_directory.is_some() => vec!["project".to_string()],
            None => Vec::new(),
        }
    }

    /// Allowed-tool list with bash allow entries expanded to tool patterns.
    pub fn expanded_allowed_tools(&self) -> Vec<String> {
        let mut tools = self.allowed_tools.clone();
        for cmd in &self.bash_allow {
            tools.push(format!("Bash({} *)", cmd));
        }
        tools
    }

    /// Denied-tool list with bash deny patterns expanded.
    pub fn expanded_denied_tools(&self) -> Vec<String> {
        let mut tools = self.denied_tools.clone();
        for pattern in &self.bash_deny {
            tools.push(format!("Bash({})", pattern));
        }
        tools
    }

    /// Whether this agent executes in a sibling container.
    pub fn uses_container(&self) -> bool {
        self.runtime == RuntimeKind::Container
            || self.docker.as_ref().map(|d| d.enabled).unwrap_or(false)
    }
}

/// Fleet-level container defaults, overridable per agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FleetDockerDefaults {
    pub image: Option<String>,
    pub network: Option<String>,
    /// Accepted only here, never from per-message input.
    pub host_config: Option<serde_json::Value>,
}

/// A named collection of agents plus fleet-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub name: String,
    /// State root; defaults to `.ccfleet` under the process working dir.
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub docker: FleetDockerDefaults,
    pub agents: Vec<AgentConfig>,
}

impl FleetConfig {
    /// Validate names and cross-agent invariants before the fleet starts.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !is_valid_identifier(&agent.name) {
                return Err(FleetError::configuration(format!(
                    "agent name {:?} does not match the identifier pattern",
                    agent.name
                )));
            }
            if !seen.insert(agent.name.as_str()) {
                return Err(FleetError::configuration(format!(
                    "duplicate agent name {:?}",
                    agent.name
                )));
            }
            if let Some(wd) = &agent.working_directory {
                if !wd.is_absolute() {
                    return Err(FleetError::configuration(format!(
                        "agent {:?}: working_directory must be absolute",
                        agent.name
                    )));
                }
            }
            for schedule in &agent.schedules {
                if !is_valid_identifier(&schedule.name) {
                    return Err(FleetError::configuration(format!(
                        "agent {:?}: schedule name {:?} does not match the identifier pattern",
                        agent.name, schedule.name
                    )));
                }
                if schedule.interval_secs.is_some() == schedule.cron.is_some() {
                    return Err(FleetError::configuration(format!(
                        "agent {:?}: schedule {:?} must set exactly one of interval_secs / cron",
                        agent.name, schedule.name
                    )));
                }
            }
            if let Some(docker) = &agent.docker {
                if docker.network.as_deref() == Some("none") {
                    return Err(FleetError::configuration(format!(
                        "agent {:?}: docker network `none` would cut the agent off from the provider",
                        agent.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolved state root directory.
    pub fn state_root(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".ccfleet"))
    }

    pub fn agent(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.name == name)
    }
}
