//! In-process runtime: drives the provider CLI as a child process.
//!
//! The provider is invoked once per turn with line-delimited JSON streaming
//! on stdout. Each line becomes one upstream message; lines that fail to
//! parse are forwarded as raw strings so the processor can log them without
//! killing the stream. Cancellation kills the child within one poll.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RuntimeKind;
use crate::error::{FleetError, Result};
use crate::runtime::{
    provider_args, AgentRuntime, ExecutionRequest, MessageStream, ToolBridge,
};

/// Upper bound on captured stderr used for error classification.
const STDERR_CAP: usize = 16 * 1024;

/// Executes turns by spawning the provider CLI on this host.
#[derive(Debug, Clone)]
pub struct InProcessRuntime {
    provider_command: String,
}

impl Default for InProcessRuntime {
    fn default() -> Self {
        Self {
            provider_command: "claude".to_string(),
        }
    }
}

impl InProcessRuntime {
    pub fn new(provider_command: impl Into<String>) -> Self {
        Self {
            provider_command: provider_command.into(),
        }
    }
}

#[async_trait]
impl AgentRuntime for InProcessRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::InProcess
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<MessageStream> {
        let agent_name = request.agent.name.clone();

        // Injected tool servers ride a local HTTP bridge advertised to the
        // provider as MCP servers; handlers still run in this process.
        let bridge = if request.injected_tool_servers.is_empty() {
            None
        } else {
            let bridge = ToolBridge::start(
                request.injected_tool_servers.clone(),
                "127.0.0.1",
                request.cancel.child_token(),
            )
            .await?;
            Some(bridge)
        };

        let extra = bridge
            .as_ref()
            .map(|b| b.mcp_server_entries())
            .unwrap_or_default();
        let args = provider_args(&request, &extra);

        let mut cmd = Command::new(&self.provider_command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(wd) = &request.agent.working_directory {
            cmd.current_dir(wd);
        }

        debug!(agent = %agent_name, job_id = %request.job_id, "spawning provider process");
        let mut child = cmd.spawn().map_err(|e| FleetError::RunnerInit {
            agent: agent_name.clone(),
            message: format!("failed to spawn provider command {:?}: {}", self.provider_command, e),
            source: Some(Box::new(e)),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            FleetError::runner_init(agent_name.clone(), "provider stdout not captured")
        })?;
        let mut stderr = child.stderr.take();

        // Drain stderr concurrently so a chatty provider never deadlocks on
        // a full pipe; keep a capped tail for error classification.
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(err) = stderr.as_mut() {
                let mut chunk = [0u8; 4096];
                while let Ok(n) = err.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.len() > STDERR_CAP {
                        let excess = buf.len() - STDERR_CAP;
                        buf.drain(..excess);
                    }
                }
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        let (tx, rx) = mpsc::channel(64);
        let cancel = request.cancel.clone();
        let agent = agent_name.clone();

        tokio::spawn(async move {
            // Keep the bridge alive for the lifetime of the turn.
            let _bridge = bridge;
            let mut lines = BufReader::new(stdout).lines();
            let mut yielded_any = false;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(agent = %agent, "turn cancelled, killing provider process");
                        let _ = child.kill().await;
                        let _ = tx
                            .send(Err(FleetError::runner_stream(&agent, "turn cancelled")))
                            .await;
                        return;
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                if line.trim().is_empty() {
                                    continue;
                                }
                                let value = serde_json::from_str(&line)
                                    .unwrap_or(serde_json::Value::String(line));
                                yielded_any = true;
                                if tx.send(Ok(value)).await.is_err() {
                                    // Receiver gone: stop the provider too.
                                    let _ = child.kill().await;
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(agent = %agent, error = %e, "provider stdout read failed");
                                break;
                            }
                        }
                    }
                }
            }

            let status = child.wait().await;
            let stderr_tail = stderr_task.await.unwrap_or_default();
            match status {
                Ok(status) if status.success() => {
                    debug!(agent = %agent, "provider process exited cleanly");
                }
                Ok(status) => {
                    let message = format!(
                        "provider exited with {}: {}",
                        status,
                        stderr_tail.trim()
                    );
                    let error = if yielded_any {
                        FleetError::runner_stream(&agent, message)
                    } else {
                        FleetError::runner_init(&agent, message)
                    };
                    let _ = tx.send(Err(error)).await;
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(FleetError::runner_stream(
                            &agent,
                            format!("failed to await provider process: {}", e),
                        )))
                        .await;
                }
            }
        });

        Ok(rx)
    }
}
