//! HTTP bridge serving injected tool servers to agents.
//!
//! Each [`InjectedToolServer`] is exposed as a JSON-RPC 2.0 endpoint at
//! `/mcp/<server>` and advertised to the provider as an HTTP MCP server.
//! In-process agents reach it on localhost; containerized agents reach it
//! by service name on the agent network. One bridge serves both runtimes.

use axum::extract::{Path as AxumPath, State};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::runtime::{InjectedTool, InjectedToolServer};

/// JSON-RPC 2.0 request envelope.
#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

/// JSON-RPC 2.0 response envelope.
#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(json!({"code": code, "message": message})),
        }
    }
}

struct BridgeState {
    servers: HashMap<String, InjectedToolServer>,
}

/// A running bridge. Shuts the listener down on drop or cancellation.
pub struct ToolBridge {
    port: u16,
    /// Hostname agents use to reach the bridge. `127.0.0.1` for in-process
    /// turns; the orchestrator's service name for containerized turns.
    advertised_host: String,
    server_names: Vec<String>,
    cancel: CancellationToken,
}

impl ToolBridge {
    /// Bind on an ephemeral port and serve `servers` until cancelled.
    pub async fn start(
        servers: Vec<InjectedToolServer>,
        advertised_host: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let server_names: Vec<String> = servers.iter().map(|s| s.name.clone()).collect();
        let state = Arc::new(BridgeState {
            servers: servers.into_iter().map(|s| (s.name.clone(), s)).collect(),
        });

        let app = Router::new()
            .route("/mcp/:server", post(handle_rpc))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| FleetError::RunnerInit {
                agent: String::new(),
                message: format!("tool bridge bind failed: {}", e),
                source: Some(Box::new(e)),
            })?;
        let port = listener
            .local_addr()
            .map(|a| a.port())
            .map_err(FleetError::from)?;

        let shutdown = cancel.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "tool bridge server exited with error");
            }
        });

        info!(port, servers = ?server_names, "tool bridge started");
        Ok(Self {
            port,
            advertised_host: advertised_host.into(),
            server_names,
            cancel,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// MCP server entries for the provider's `--mcp-config`.
    pub fn mcp_server_entries(&self) -> HashMap<String, Value> {
        self.server_names
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    json!({
                        "type": "http",
                        "url": format!("http://{}:{}/mcp/{}", self.advertised_host, self.port, name),
                    }),
                )
            })
            .collect()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ToolBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handle_rpc(
    State(state): State<Arc<BridgeState>>,
    AxumPath(server): AxumPath<String>,
    Json(request): Json<RpcRequest>,
) -> Json<RpcResponse> {
    let id = request.id.unwrap_or(Value::Null);

    let Some(tool_server) = state.servers.get(&server) else {
        return Json(RpcResponse::failure(
            id,
            -32601,
            format!("unknown tool server: {}", server),
        ));
    };

    debug!(server = %server, method = %request.method, "bridge rpc");

    match request.method.as_str() {
        "initialize" => Json(RpcResponse::success(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": tool_server.name, "version": tool_server.version},
            }),
        )),
        "notifications/initialized" => Json(RpcResponse::success(id, Value::Null)),
        "tools/list" => {
            let tools: Vec<Value> = tool_server
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "inputSchema": t.input_schema,
                    })
                })
                .collect();
            Json(RpcResponse::success(id, json!({"tools": tools})))
        }
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("");
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or(Value::Null);

            let Some(tool) = tool_server.tools.iter().find(|t| t.name == name) else {
                return Json(RpcResponse::failure(
                    id,
                    -32602,
                    format!("unknown tool: {}", name),
                ));
            };

            match (tool.handler)(arguments).await {
                Ok(result) => Json(RpcResponse::success(
                    id,
                    json!({
                        "content": [{"type": "text", "text": result.to_string()}],
                        "isError": false,
                    }),
                )),
                Err(e) => Json(RpcResponse::success(
                    id,
                    json!({
                        "content": [{"type": "text", "text": e.to_string()}],
                        "isError": true,
                    }),
                )),
            }
        }
        other => Json(RpcResponse::failure(
            id,
            -32601,
            format!("unknown method: {}", other),
        )),
    }
}

/// Upload callback: `(file_name, bytes)` handed to the event source that
/// requested the turn (e.g. the chat manager posts it to the thread).
pub type UploadFn =
    Arc<dyn Fn(String, Vec<u8>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Tool letting an agent publish a file from its working directory.
///
/// The handler refuses any requested path that normalizes outside the
/// working directory, whether via `..` segments or an absolute path.
pub fn upload_file_tool(working_dir: PathBuf, upload: UploadFn) -> InjectedTool {
    let handler = move |args: Value| -> BoxFuture<'static, anyhow::Result<Value>> {
        let working_dir = working_dir.clone();
        let upload = upload.clone();
        Box::pin(async move {
            let requested = args
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("missing required argument: path"))?;

            let resolved = resolve_under(&working_dir, requested)
                .ok_or_else(|| anyhow::anyhow!("path escapes the working directory: {}", requested))?;

            let bytes = tokio::fs::read(&resolved).await?;
            let name = resolved
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());

            upload(name.clone(), bytes).await?;
            Ok(json!({"uploaded": name}))
        })
    };

    InjectedTool {
        name: "upload_file".to_string(),
        description: "Upload a file from the working directory to the requesting channel"
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path relative to the working directory"}
            },
            "required": ["path"],
        }),
        handler: Arc::new(handler),
    }
}

/// Join `requested` under `root` and verify it cannot escape.
fn resolve_under(root: &Path, requested: &str) -> Option<PathBuf> {
    let requested = Path::new(requested);
    if requested.is_absolute() {
        // Absolute paths are accepted only when already under the root.
        let normalized = normalize(requested);
        return normalized.starts_with(root).then_some(normalized);
    }

    let joined = root.join(requested);
    let normalized = normalize(&joined);
    normalized.starts_with(root).then_some(normalized)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
