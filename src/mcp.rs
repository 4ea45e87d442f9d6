//! MCP tool server manager.
//!
//! Owns the child processes behind external tool servers and exposes a
//! uniform view of their tools. Each server runs over stdio (spawned via
//! the rmcp child-process transport) and moves through a small lifecycle:
//!
//! ```text
//! Configured → Starting → Running → Stopping → Stopped
//!                  │          │
//!                  └──────────┴──▶ Failed
//! ```
//!
//! Tools are namespaced `<server>_<tool>` so names stay globally unique
//! across servers. Callers only ever see value-typed snapshots
//! ([`ServerInfo`], [`ToolInfo`]); the process handles never leave the
//! manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{CallToolRequestParams, CallToolResult, Content, RawContent};
use rmcp::service::{Peer, RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::ServiceExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::McpConfig;
use crate::error::{Error, Result};
use crate::models::{ToolDefinition, ToolResult};

/// Handshake deadline when starting a server.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Lifecycle state of a managed tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Configured,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ServerState {
    /// A server can (re)start from any resting state.
    fn can_start(self) -> bool {
        matches!(self, Self::Configured | Self::Stopped | Self::Failed)
    }
}

/// Value-typed snapshot of a managed server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub state: ServerState,
    pub tool_count: usize,
}

/// Value-typed snapshot of a discovered tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    /// Namespaced name: `<server>_<tool>`.
    pub name: String,
    pub server: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolInfo {
    /// Convert to the definition shape handed to generators.
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// A cached tool as discovered from a server (bare name).
#[derive(Debug, Clone)]
struct DiscoveredTool {
    name: String,
    description: String,
    parameters: Value,
}

struct ServerHandle {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    state: ServerState,
    service: Option<RunningService<RoleClient, ()>>,
    peer: Option<Arc<Peer<RoleClient>>>,
    tools: Vec<DiscoveredTool>,
    health_failures: u32,
}

/// Manager owning every configured tool server.
pub struct McpManager {
    enabled: bool,
    servers: Mutex<HashMap<String, ServerHandle>>,
    call_semaphore: Arc<Semaphore>,
    call_timeout: Duration,
    health_threshold: u32,
}

impl McpManager {
    /// Build a manager from configuration. Servers start in `Configured`
    /// and are launched explicitly via [`start_server`](Self::start_server)
    /// or [`start_all`](Self::start_all).
    pub fn new(config: &McpConfig) -> Self {
        let servers = config
            .servers
            .iter()
            .map(|(name, server)| {
                (
                    name.clone(),
                    ServerHandle {
                        command: server.command.clone(),
                        args: server.args.clone(),
                        env: server.env.clone(),
                        state: ServerState::Configured,
                        service: None,
                        peer: None,
                        tools: Vec::new(),
                        health_failures: 0,
                    },
                )
            })
            .collect();

        Self {
            enabled: config.enabled,
            servers: Mutex::new(servers),
            call_semaphore: Arc::new(Semaphore::new(config.max_concurrent_calls)),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            health_threshold: config.health_failure_threshold,
        }
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(Error::Unavailable("MCP is disabled by configuration".into()))
        }
    }

    /// Start a configured server: spawn the child process, run the MCP
    /// handshake, and discover its tools.
    pub async fn start_server(&self, name: &str) -> Result<()> {
        self.ensure_enabled()?;

        // Reserve the Starting state without holding the lock across the
        // handshake.
        let (command, args, env) = {
            let mut servers = self.servers.lock().await;
            let handle = servers
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("server '{name}'")))?;
            if handle.state == ServerState::Running || handle.state == ServerState::Starting {
                return Ok(());
            }
            if !handle.state.can_start() {
                return Err(Error::invalid_arg(format!(
                    "server '{name}' cannot start from state {:?}",
                    handle.state
                )));
            }
            handle.state = ServerState::Starting;
            (handle.command.clone(), handle.args.clone(), handle.env.clone())
        };

        let startup = async {
            let mut cmd = tokio::process::Command::new(&command);
            cmd.args(&args);
            for (key, value) in &env {
                cmd.env(key, value);
            }

            let transport = TokioChildProcess::new(cmd)
                .map_err(|e| Error::Unavailable(format!("spawn '{command}': {e}")))?;
            let service = ().serve(transport).await.map_err(|e| {
                Error::Unavailable(format!("MCP handshake with '{name}' failed: {e}"))
            })?;

            let tools = service.list_all_tools().await.map_err(|e| {
                Error::Unavailable(format!("tool discovery on '{name}' failed: {e}"))
            })?;

            let discovered: Vec<DiscoveredTool> = tools
                .into_iter()
                .map(|tool| DiscoveredTool {
                    name: tool.name.to_string(),
                    description: tool.description.as_deref().unwrap_or("").to_string(),
                    parameters: serde_json::to_value(&*tool.input_schema)
                        .unwrap_or_else(|_| serde_json::json!({"type": "object"})),
                })
                .collect();

            Ok::<_, Error>((service, discovered))
        };

        let outcome = tokio::time::timeout(STARTUP_TIMEOUT, startup).await;

        let mut servers = self.servers.lock().await;
        let handle = servers
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("server '{name}'")))?;

        match outcome {
            Ok(Ok((service, discovered))) => {
                debug!(server = name, tools = discovered.len(), "MCP server running");
                handle.peer = Some(Arc::new(service.peer().clone()));
                handle.service = Some(service);
                handle.tools = discovered;
                handle.health_failures = 0;
                handle.state = ServerState::Running;
                Ok(())
            }
            Ok(Err(e)) => {
                handle.state = ServerState::Failed;
                Err(e)
            }
            Err(_) => {
                handle.state = ServerState::Failed;
                Err(Error::Timeout(STARTUP_TIMEOUT))
            }
        }
    }

    /// Stop a running server, shutting the child process down.
    pub async fn stop_server(&self, name: &str) -> Result<()> {
        self.ensure_enabled()?;

        let service = {
            let mut servers = self.servers.lock().await;
            let handle = servers
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("server '{name}'")))?;
            if handle.state != ServerState::Running {
                return Ok(());
            }
            handle.state = ServerState::Stopping;
            handle.peer = None;
            handle.tools.clear();
            handle.service.take()
        };

        if let Some(service) = service {
            if let Err(e) = service.cancel().await {
                warn!(server = name, "MCP shutdown was not clean: {e}");
            }
        }

        let mut servers = self.servers.lock().await;
        if let Some(handle) = servers.get_mut(name) {
            handle.state = ServerState::Stopped;
        }
        Ok(())
    }

    /// Start every configured server, reporting failures without aborting
    /// the rest.
    pub async fn start_all(&self) -> Result<()> {
        self.ensure_enabled()?;
        let names: Vec<String> = {
            let servers = self.servers.lock().await;
            servers.keys().cloned().collect()
        };
        for name in names {
            if let Err(e) = self.start_server(&name).await {
                warn!(server = %name, "failed to start MCP server: {e}");
            }
        }
        Ok(())
    }

    /// Stop every running server.
    pub async fn stop_all(&self) -> Result<()> {
        self.ensure_enabled()?;
        let names: Vec<String> = {
            let servers = self.servers.lock().await;
            servers.keys().cloned().collect()
        };
        for name in names {
            let _ = self.stop_server(&name).await;
        }
        Ok(())
    }

    /// Snapshot of every configured server.
    pub async fn list_servers(&self) -> Result<Vec<ServerInfo>> {
        self.ensure_enabled()?;
        let servers = self.servers.lock().await;
        let mut infos: Vec<ServerInfo> = servers
            .iter()
            .map(|(name, handle)| ServerInfo {
                name: name.clone(),
                command: handle.command.clone(),
                args: handle.args.clone(),
                state: handle.state,
                tool_count: handle.tools.len(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    /// Snapshot of every tool across running servers, namespaced.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        self.ensure_enabled()?;
        let servers = self.servers.lock().await;
        let mut tools: Vec<ToolInfo> = Vec::new();
        for (server_name, handle) in servers.iter() {
            if handle.state != ServerState::Running {
                continue;
            }
            for tool in &handle.tools {
                tools.push(ToolInfo {
                    name: namespaced(server_name, &tool.name),
                    server: server_name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                });
            }
        }
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    /// Invoke a namespaced tool with schema-validated arguments.
    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult> {
        self.ensure_enabled()?;

        let (server_name, bare_name, peer, schema) = self.resolve_tool(name).await?;
        validate_args(&schema, &args)?;

        let permit = self
            .call_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Canceled)?;

        let params = CallToolRequestParams {
            meta: None,
            name: bare_name.clone().into(),
            arguments: args.as_object().cloned(),
            task: None,
        };

        let call = peer.call_tool(params);
        let result = tokio::select! {
            outcome = tokio::time::timeout(self.call_timeout, call) => outcome,
            () = cancel.cancelled() => {
                drop(permit);
                return Err(Error::Canceled);
            }
        };
        drop(permit);

        match result {
            Ok(Ok(call_result)) => {
                self.record_health(&server_name, true).await;
                Ok(convert_result(call_result))
            }
            Ok(Err(e)) => {
                self.record_health(&server_name, false).await;
                Ok(ToolResult::err(e.to_string()))
            }
            Err(_) => {
                self.record_health(&server_name, false).await;
                Err(Error::Timeout(self.call_timeout))
            }
        }
    }

    /// Execute a batch of calls concurrently (bounded by the configured
    /// cap), preserving input order in the result list. Per-call failures
    /// are reported in place; only cancellation fails the batch.
    pub async fn batch_call(
        &self,
        calls: Vec<(String, Value)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolResult>> {
        self.ensure_enabled()?;

        let futures = calls.into_iter().map(|(name, args)| async move {
            match self.call_tool(&name, args, cancel).await {
                Ok(result) => Ok(result),
                Err(Error::Canceled) => Err(Error::Canceled),
                Err(e) => Ok(ToolResult::err(e.to_string())),
            }
        });

        futures_util::future::join_all(futures)
            .await
            .into_iter()
            .collect()
    }

    /// Probe every running server; consecutive failures beyond the
    /// threshold mark a server failed.
    pub async fn health_check(&self) -> Result<()> {
        self.ensure_enabled()?;

        let running: Vec<(String, Arc<Peer<RoleClient>>)> = {
            let servers = self.servers.lock().await;
            servers
                .iter()
                .filter(|(_, h)| h.state == ServerState::Running)
                .filter_map(|(name, h)| h.peer.clone().map(|p| (name.clone(), p)))
                .collect()
        };

        for (name, peer) in running {
            let probe = tokio::time::timeout(self.call_timeout, peer.list_all_tools()).await;
            let healthy = matches!(probe, Ok(Ok(_)));
            self.record_health(&name, healthy).await;
        }
        Ok(())
    }

    async fn record_health(&self, server: &str, healthy: bool) {
        let mut servers = self.servers.lock().await;
        let Some(handle) = servers.get_mut(server) else {
            return;
        };
        if healthy {
            handle.health_failures = 0;
            return;
        }
        handle.health_failures += 1;
        if handle.health_failures > self.health_threshold && handle.state == ServerState::Running {
            warn!(
                server,
                failures = handle.health_failures,
                "marking MCP server failed"
            );
            handle.state = ServerState::Failed;
            handle.peer = None;
            handle.service = None;
            handle.tools.clear();
        }
    }

    /// Resolve a namespaced tool name to its server, bare name, peer, and
    /// parameter schema.
    async fn resolve_tool(
        &self,
        name: &str,
    ) -> Result<(String, String, Arc<Peer<RoleClient>>, Value)> {
        let servers = self.servers.lock().await;

        // Longest server-name prefix wins so `fs_ext_read` resolves to
        // server `fs_ext` before server `fs`.
        let mut best: Option<(&String, &ServerHandle, &str)> = None;
        for (server_name, handle) in servers.iter() {
            if let Some(bare) = name.strip_prefix(&format!("{server_name}_")) {
                let better = match best {
                    Some((current, _, _)) => server_name.len() > current.len(),
                    None => true,
                };
                if better {
                    best = Some((server_name, handle, bare));
                }
            }
        }

        let (server_name, handle, bare_name) =
            best.ok_or_else(|| Error::NotFound(format!("tool '{name}'")))?;

        if handle.state != ServerState::Running {
            return Err(Error::Unavailable(format!(
                "server '{server_name}' is not running"
            )));
        }

        let tool = handle
            .tools
            .iter()
            .find(|t| t.name == bare_name)
            .ok_or_else(|| Error::NotFound(format!("tool '{name}'")))?;

        let peer = handle
            .peer
            .clone()
            .ok_or_else(|| Error::Unavailable(format!("server '{server_name}' has no peer")))?;

        Ok((
            server_name.clone(),
            tool.name.clone(),
            peer,
            tool.parameters.clone(),
        ))
    }
}

/// Namespace a bare tool name with its server.
fn namespaced(server: &str, tool: &str) -> String {
    format!("{server}_{tool}")
}

/// Validate call arguments against a JSON-Schema-like parameter object.
///
/// Checks that arguments form an object, every `required` key is present,
/// and declared property types match.
fn validate_args(schema: &Value, args: &Value) -> Result<()> {
    let Some(args_obj) = args.as_object() else {
        return Err(Error::invalid_arg("tool arguments must be a JSON object"));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args_obj.contains_key(key) {
                return Err(Error::invalid_arg(format!(
                    "missing required argument '{key}'"
                )));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in args_obj {
            let Some(declared) = properties.get(key) else {
                continue;
            };
            let Some(expected) = declared.get("type").and_then(Value::as_str) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(Error::invalid_arg(format!(
                    "argument '{key}' should be of type {expected}"
                )));
            }
        }
    }

    Ok(())
}

/// Convert an rmcp call result into the platform's tool result shape.
fn convert_result(result: CallToolResult) -> ToolResult {
    if result.is_error == Some(true) {
        return ToolResult::err(extract_text(&result.content));
    }

    if let Some(structured) = result.structured_content {
        return ToolResult::ok(structured);
    }

    ToolResult::ok(Value::String(extract_text(&result.content)))
}

/// Extract text from MCP content blocks.
fn extract_text(content: &[Content]) -> String {
    content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
