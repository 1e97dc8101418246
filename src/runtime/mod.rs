//! Runtime abstraction: one streaming-execution contract, two backends.
//!
//! A runtime turns one prompt into a lazy sequence of upstream provider
//! messages. The in-process runtime drives the provider CLI as a child
//! process; the container runtime spawns a hardened sibling container over
//! the host Docker socket. Callers consume the same [`MessageStream`]
//! either way and cancel through the request's token.

pub mod bridge;
pub mod container;
pub mod in_process;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, McpServerConfig, RuntimeKind};
use crate::error::Result;

pub use bridge::{upload_file_tool, ToolBridge, UploadFn};

/// Lazily-consumed upstream messages. `Err` items carry stream failures;
/// the channel closing marks the end of the sequence.
pub type MessageStream = mpsc::Receiver<Result<serde_json::Value>>;

/// Handler for one injected tool invocation.
pub type ToolHandler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, anyhow::Result<serde_json::Value>>
        + Send
        + Sync,
>;

/// One tool exposed to the agent by the orchestrator itself.
#[derive(Clone)]
pub struct InjectedTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub handler: ToolHandler,
}

impl std::fmt::Debug for InjectedTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectedTool")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A named group of injected tools, advertised to the provider as one
/// MCP server.
#[derive(Debug, Clone)]
pub struct InjectedToolServer {
    pub name: String,
    pub version: String,
    pub tools: Vec<InjectedTool>,
}

/// Everything a runtime needs for one turn.
#[derive(Clone)]
pub struct ExecutionRequest {
    pub prompt: String,
    pub agent: AgentConfig,
    /// Job the turn belongs to; used for container naming and log context.
    pub job_id: String,
    /// Upstream session to continue, verbatim. The provider decides
    /// validity; runtimes never reinterpret it.
    pub resume: Option<String>,
    /// Fork the resumed session instead of continuing it.
    pub fork: bool,
    pub cancel: CancellationToken,
    pub injected_tool_servers: Vec<InjectedToolServer>,
}

impl std::fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("agent", &self.agent.name)
            .field("job_id", &self.job_id)
            .field("resume", &self.resume)
            .field("fork", &self.fork)
            .finish_non_exhaustive()
    }
}

/// Streaming-execution contract implemented by both runtimes.
///
/// Guarantees: messages arrive in causal order; cancellation terminates
/// the stream in bounded time and releases all resources; failures before
/// the first message are init errors.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    async fn execute(&self, request: ExecutionRequest) -> Result<MessageStream>;
}

/// Build the provider CLI argument vector for one turn.
///
/// Shared by both runtimes so a container executes the turn with exactly
/// the options an in-process turn would use. `extra_mcp_servers` carries
/// the bridge-served injected tool servers.
pub fn provider_args(
    request: &ExecutionRequest,
    extra_mcp_servers: &HashMap<String, serde_json::Value>,
) -> Vec<String> {
    let agent = &request.agent;
    let mut args = vec![
        "-p".to_string(),
        request.prompt.clone(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];

    if let Some(model) = &agent.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }

    args.push("--permission-mode".to_string());
    args.push(agent.permission_mode.as_str().to_string());

    let allowed = agent.expanded_allowed_tools();
    if !allowed.is_empty() {
        args.push("--allowed-tools".to_string());
        args.push(allowed.join(","));
    }
    let denied = agent.expanded_denied_tools();
    if !denied.is_empty() {
        args.push("--disallowed-tools".to_string());
        args.push(denied.join(","));
    }

    if let Some(prompt) = &agent.system_prompt {
        args.push("--system-prompt".to_string());
        args.push(prompt.clone());
    }

    let sources = agent.effective_setting_sources();
    if !sources.is_empty() {
        args.push("--setting-sources".to_string());
        args.push(sources.join(","));
    }

    if let Some(max_turns) = agent.max_turns {
        args.push("--max-turns".to_string());
        args.push(max_turns.to_string());
    }

    let mcp = mcp_config(agent, extra_mcp_servers);
    if let Some(config) = mcp {
        args.push("--mcp-config".to_string());
        args.push(config);
    }

    if let Some(resume) = &request.resume {
        args.push("--resume".to_string());
        args.push(resume.clone());
        if request.fork {
            args.push("--fork-session".to_string());
        }
    }

    args
}

/// Merge the agent's configured MCP servers with bridge-injected ones into
/// the provider's `--mcp-config` JSON payload.
fn mcp_config(
    agent: &AgentConfig,
    extra: &HashMap<String, serde_json::Value>,
) -> Option<String> {
    if agent.mcp_servers.is_empty() && extra.is_empty() {
        return None;
    }

    let mut servers = serde_json::Map::new();
    for (name, server) in &agent.mcp_servers {
        let value = match server {
            McpServerConfig::Url { url } => serde_json::json!({"type": "http", "url": url}),
            McpServerConfig::Command { command, args, env } => serde_json::json!({
                "command": command,
                "args": args,
                "env": env,
            }),
        };
        servers.insert(name.clone(), value);
    }
    for (name, value) in extra {
        servers.insert(name.clone(), value.clone());
    }

    Some(serde_json::json!({ "mcpServers": servers }).to_string())
}
