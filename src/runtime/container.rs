//! Container runtime: executes a turn in a sibling container.
//!
//! Containers are created over the host Docker socket, never
//! Docker-in-Docker, so every path handed to the daemon is a host path.
//! Each turn gets its own hardened container: all capabilities dropped,
//! `no-new-privileges`, a named network (so the agent can reach the
//! provider and the tool bridge), and a memory limit from agent config.
//! The container is force-removed on terminal output and on cancellation.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::network::CreateNetworkOptions;
use bollard::service::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::{FleetDockerDefaults, RuntimeKind};
use crate::error::{FleetError, Result};
use crate::runtime::{
    provider_args, AgentRuntime, ExecutionRequest, MessageStream, ToolBridge,
};
use crate::utils::is_valid_identifier;

const DEFAULT_NETWORK: &str = "ccfleet-network";
const PROVIDER_COMMAND: &str = "claude";

/// Executes turns in sibling containers on the host Docker daemon.
pub struct ContainerRuntime {
    docker: Docker,
    defaults: FleetDockerDefaults,
    /// Hostname agents use to reach the tool bridge on the agent network.
    bridge_host: String,
}

impl ContainerRuntime {
    /// Connect to the Docker daemon and verify it responds.
    pub async fn new(defaults: FleetDockerDefaults, bridge_host: impl Into<String>) -> Result<Self> {
        let docker = Self::connect().map_err(|e| FleetError::RunnerInit {
            agent: String::new(),
            message: format!("failed to connect to Docker: {}", e),
            source: Some(Box::new(e)),
        })?;

        docker.ping().await.map_err(|e| FleetError::RunnerInit {
            agent: String::new(),
            message: format!("Docker daemon did not answer ping: {}", e),
            source: Some(Box::new(e)),
        })?;

        info!("container runtime connected to Docker daemon");
        Ok(Self {
            docker,
            defaults,
            bridge_host: bridge_host.into(),
        })
    }

    fn connect() -> std::result::Result<Docker, bollard::errors::Error> {
        if let Ok(host) = std::env::var("DOCKER_HOST") {
            if let Some(path) = host.strip_prefix("unix://") {
                debug!(socket = %path, "connecting to Docker via DOCKER_HOST");
                return Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION);
            }
        }
        Docker::connect_with_socket_defaults()
    }

    /// Create the named agent network when it does not already exist.
    async fn ensure_network(&self, name: &str) -> Result<()> {
        match self
            .docker
            .inspect_network(name, None::<bollard::network::InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => {
                debug!(network = name, "using existing agent network");
                Ok(())
            }
            Err(_) => {
                info!(network = name, "creating agent network");
                let options = CreateNetworkOptions {
                    name,
                    driver: "bridge",
                    labels: HashMap::from([("managed-by", "ccfleet")]),
                    ..Default::default()
                };
                self.docker
                    .create_network(options)
                    .await
                    .map_err(|e| FleetError::RunnerInit {
                        agent: String::new(),
                        message: format!("failed to create network {}: {}", name, e),
                        source: Some(Box::new(e)),
                    })?;
                Ok(())
            }
        }
    }

    /// Pull the image when it is not present locally.
    async fn ensure_image(&self, agent: &str, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!(image, "pulling agent image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => trace!(?info, "image pull progress"),
                Err(e) => {
                    return Err(FleetError::RunnerInit {
                        agent: agent.to_string(),
                        message: format!("failed to pull image {}: {}", image, e),
                        source: Some(Box::new(e)),
                    })
                }
            }
        }
        Ok(())
    }

    fn build_config(
        &self,
        request: &ExecutionRequest,
        image: &str,
        network: &str,
        args: Vec<String>,
    ) -> Config<String> {
        let agent = &request.agent;
        let docker_cfg = agent.docker.clone().unwrap_or_default();

        let mut cmd = vec![PROVIDER_COMMAND.to_string()];
        cmd.extend(args);

        // Host-side working directory bind-mounted at the same path, so
        // file paths in provider output mean the same thing on the host.
        let (binds, working_dir) = match &agent.working_directory {
            Some(wd) => {
                let host_path = wd.display().to_string();
                (
                    Some(vec![format!("{}:{}", host_path, host_path)]),
                    Some(host_path),
                )
            }
            None => (None, None),
        };

        let env: Vec<String> = docker_cfg
            .env_passthrough
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| format!("{}={}", key, v)))
            .collect();

        let mut host_config = HostConfig {
            binds,
            memory: docker_cfg.memory,
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            network_mode: Some(network.to_string()),
            ..Default::default()
        };

        // Overrides come from static fleet configuration only (fleet-wide
        // first, then the agent's own entry); per-message input never
        // reaches this merge.
        if let Some(override_value) = &self.defaults.host_config {
            host_config = merge_host_config(host_config, override_value);
        }
        if let Some(override_value) = &docker_cfg.host_config {
            host_config = merge_host_config(host_config, override_value);
        }

        Config {
            image: Some(image.to_string()),
            cmd: Some(cmd),
            env: Some(env),
            working_dir,
            host_config: Some(host_config),
            labels: Some(HashMap::from([
                ("managed-by".to_string(), "ccfleet".to_string()),
                ("ccfleet-agent".to_string(), agent.name.clone()),
                ("ccfleet-job".to_string(), request.job_id.clone()),
            ])),
            ..Default::default()
        }
    }

    async fn remove(&self, container_id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(container_id, Some(options)).await {
            warn!(container_id, error = %e, "container removal failed");
        } else {
            debug!(container_id, "container removed");
        }
    }
}

/// Overlay the fleet-level host-config override onto the hardened base.
fn merge_host_config(base: HostConfig, override_value: &serde_json::Value) -> HostConfig {
    let Ok(mut base_value) = serde_json::to_value(&base) else {
        return base;
    };
    if let (Some(base_map), Some(override_map)) =
        (base_value.as_object_mut(), override_value.as_object())
    {
        for (key, value) in override_map {
            base_map.insert(key.clone(), value.clone());
        }
    }
    match serde_json::from_value(base_value) {
        Ok(merged) => merged,
        Err(e) => {
            warn!(error = %e, "host-config override did not deserialize, keeping hardened defaults");
            base
        }
    }
}

#[async_trait]
impl AgentRuntime for ContainerRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Container
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<MessageStream> {
        let agent_name = request.agent.name.clone();

        // Container identifiers derive from validated names only.
        if !is_valid_identifier(&agent_name) || !is_valid_identifier(&request.job_id) {
            return Err(FleetError::path_traversal(format!(
                "refusing container name from agent {:?} / job {:?}",
                agent_name, request.job_id
            )));
        }
        let container_name = format!("ccfleet-{}-{}", agent_name, request.job_id);

        let docker_cfg = request.agent.docker.clone().unwrap_or_default();
        let image = docker_cfg
            .image
            .clone()
            .or_else(|| self.defaults.image.clone())
            .ok_or_else(|| {
                FleetError::runner_init(&agent_name, "no container image configured")
            })?;
        let network = docker_cfg
            .network
            .clone()
            .or_else(|| self.defaults.network.clone())
            .unwrap_or_else(|| DEFAULT_NETWORK.to_string());

        self.ensure_network(&network).await?;
        self.ensure_image(&agent_name, &image).await?;

        let bridge = if request.injected_tool_servers.is_empty() {
            None
        } else {
            Some(
                ToolBridge::start(
                    request.injected_tool_servers.clone(),
                    self.bridge_host.clone(),
                    request.cancel.child_token(),
                )
                .await?,
            )
        };
        let extra = bridge
            .as_ref()
            .map(|b| b.mcp_server_entries())
            .unwrap_or_default();
        let args = provider_args(&request, &extra);
        let config = self.build_config(&request, &image, &network, args);

        let options = CreateContainerOptions {
            name: container_name.clone(),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| FleetError::RunnerInit {
                agent: agent_name.clone(),
                message: format!("failed to create container: {}", e),
                source: Some(Box::new(e)),
            })?;
        let container_id = created.id;

        if let Err(e) = self
            .docker
            .start_container::<String>(&container_id, None)
            .await
        {
            self.remove(&container_id).await;
            return Err(FleetError::RunnerInit {
                agent: agent_name.clone(),
                message: format!("failed to start container: {}", e),
                source: Some(Box::new(e)),
            });
        }
        info!(agent = %agent_name, container = %container_name, "agent container started");

        let (tx, rx) = mpsc::channel(64);
        let docker = self.docker.clone();
        let cancel = request.cancel.clone();
        let runtime = ContainerRuntimeHandle {
            docker: docker.clone(),
            container_id: container_id.clone(),
        };

        tokio::spawn(async move {
            let _bridge = bridge;
            let log_options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut logs = docker.logs(&container_id, Some(log_options));
            let mut yielded_any = false;
            let mut stderr_tail = String::new();
            let mut partial_line = String::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(agent = %agent_name, "turn cancelled, removing container");
                        runtime.remove().await;
                        let _ = tx
                            .send(Err(FleetError::runner_stream(&agent_name, "turn cancelled")))
                            .await;
                        return;
                    }
                    chunk = logs.next() => {
                        match chunk {
                            Some(Ok(LogOutput::StdOut { message })) => {
                                partial_line.push_str(&String::from_utf8_lossy(&message));
                                // Docker log frames are not line-aligned.
                                while let Some(pos) = partial_line.find('\n') {
                                    let line: String = partial_line.drain(..=pos).collect();
                                    let line = line.trim();
                                    if line.is_empty() {
                                        continue;
                                    }
                                    let value = serde_json::from_str(line)
                                        .unwrap_or_else(|_| serde_json::Value::String(line.to_string()));
                                    yielded_any = true;
                                    if tx.send(Ok(value)).await.is_err() {
                                        runtime.remove().await;
                                        return;
                                    }
                                }
                            }
                            Some(Ok(LogOutput::StdErr { message })) => {
                                stderr_tail.push_str(&String::from_utf8_lossy(&message));
                                let len = stderr_tail.len();
                                if len > 16 * 1024 {
                                    stderr_tail = stderr_tail.split_off(len - 16 * 1024);
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(agent = %agent_name, error = %e, "container log stream error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }

            // Log stream ended: collect the exit status, then clean up.
            let mut wait = docker.wait_container(
                &runtime.container_id,
                None::<WaitContainerOptions<String>>,
            );
            let exit = wait.next().await;
            let status_code = match exit {
                Some(Ok(body)) => body.status_code,
                _ => -1,
            };
            runtime.remove().await;

            if status_code != 0 {
                let message = format!(
                    "container exited with status {}: {}",
                    status_code,
                    stderr_tail.trim()
                );
                let error = if yielded_any {
                    FleetError::runner_stream(&agent_name, message)
                } else {
                    FleetError::runner_init(&agent_name, message)
                };
                let _ = tx.send(Err(error)).await;
            }
        });

        Ok(rx)
    }
}

struct ContainerRuntimeHandle {
    docker: Docker,
    container_id: String,
}

impl ContainerRuntimeHandle {
    async fn remove(&self) {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_container(&self.container_id, Some(options))
            .await
        {
            warn!(container_id = %self.container_id, error = %e, "container removal failed");
        }
    }
}
