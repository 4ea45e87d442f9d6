//! Built-in task executors: query, ingest, script, and tool.
//!
//! Executors hold shared references to the platform components and turn a
//! task's string parameter map into one unit of work. The script executor
//! only runs commands whose head appears on the configured safelist, and
//! runs them directly (no shell).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ingest;
use crate::mcp::McpManager;
use crate::models::{IngestRequest, Metadata};
use crate::provider::{Embedder, GenerationOptions, Generator};
use crate::retrieve;
use crate::scheduler::{TaskExecutor, TaskResult, TaskType};
use crate::store::VectorStore;

/// Default wall-clock budget for a script task.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

// ============ Query executor ============

/// Runs a RAG query: retrieve, compose, generate.
pub struct QueryExecutor {
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    config: Arc<Config>,
}

impl QueryExecutor {
    pub fn new(
        store: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            embedder,
            generator,
            config,
        }
    }
}

#[async_trait]
impl TaskExecutor for QueryExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::Query
    }

    fn validate(&self, params: &HashMap<String, String>) -> Result<()> {
        let query = params
            .get("query")
            .ok_or_else(|| Error::invalid_arg("query task requires a 'query' parameter"))?;
        if query.trim().is_empty() {
            return Err(Error::invalid_arg("'query' parameter must not be empty"));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<TaskResult> {
        let query = params
            .get("query")
            .ok_or_else(|| Error::invalid_arg("missing 'query' parameter"))?;
        let top_k = parse_param(params, "top_k", self.config.query.top_k)?;
        let temperature = parse_param(params, "temperature", self.config.query.temperature)?;
        let max_tokens = parse_param(params, "max_tokens", self.config.query.max_tokens)?;

        let chunks = retrieve::retrieve(
            self.embedder.as_ref(),
            &self.store,
            query,
            top_k,
            &Metadata::new(),
        )
        .await?;
        let prompt = retrieve::compose(query, &chunks, false);

        let opts = GenerationOptions {
            temperature,
            max_tokens,
            ..GenerationOptions::default()
        };
        let answer =
            crate::generation::generate(self.generator.as_ref(), &prompt, &opts, cancel).await?;

        Ok(TaskResult::ok(answer))
    }
}

// ============ Ingest executor ============

/// Runs an ingest of a file, URL, or inline text.
pub struct IngestExecutor {
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    generator: Option<Arc<dyn Generator>>,
    config: Arc<Config>,
}

impl IngestExecutor {
    pub fn new(
        store: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        generator: Option<Arc<dyn Generator>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            embedder,
            generator,
            config,
        }
    }
}

#[async_trait]
impl TaskExecutor for IngestExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::Ingest
    }

    fn validate(&self, params: &HashMap<String, String>) -> Result<()> {
        let sources = ["file_path", "url", "content"]
            .iter()
            .filter(|key| params.contains_key(**key))
            .count();
        if sources != 1 {
            return Err(Error::invalid_arg(
                "ingest task requires exactly one of 'file_path', 'url', or 'content'",
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<TaskResult> {
        let request = IngestRequest {
            content: params.get("content").cloned(),
            file_path: params.get("file_path").cloned(),
            url: params.get("url").cloned(),
            document_id: params.get("document_id").cloned(),
            chunk_size: parse_opt_param(params, "chunk_size")?,
            overlap: parse_opt_param(params, "overlap")?,
            method: params.get("method").cloned(),
            metadata: Metadata::new(),
        };

        let response = ingest::run_ingest(
            &self.store,
            self.embedder.as_ref(),
            self.generator.as_deref(),
            &self.config,
            &request,
            cancel,
        )
        .await?;

        Ok(TaskResult::ok(format!(
            "ingested document {} ({} chunks)",
            response.document_id, response.chunk_count
        )))
    }
}

// ============ Script executor ============

/// Runs a vetted command without a shell. The command head must appear on
/// the safelist; everything else is rejected at validation time.
pub struct ScriptExecutor {
    allowed_commands: Vec<String>,
}

impl ScriptExecutor {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        Self { allowed_commands }
    }

    fn check_command<'a>(&self, params: &'a HashMap<String, String>) -> Result<Vec<&'a str>> {
        let command = params
            .get("command")
            .ok_or_else(|| Error::invalid_arg("script task requires a 'command' parameter"))?;

        let parts: Vec<&str> = command.split_whitespace().collect();
        let head = *parts
            .first()
            .ok_or_else(|| Error::invalid_arg("'command' parameter must not be empty"))?;

        // Match the head itself or its basename against the safelist.
        let basename = head.rsplit('/').next().unwrap_or(head);
        let allowed = self
            .allowed_commands
            .iter()
            .any(|entry| entry == head || entry == basename);
        if !allowed {
            return Err(Error::invalid_arg(format!(
                "command '{head}' is not on the scheduler safelist"
            )));
        }

        Ok(parts)
    }
}

#[async_trait]
impl TaskExecutor for ScriptExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::Script
    }

    fn validate(&self, params: &HashMap<String, String>) -> Result<()> {
        self.check_command(params).map(|_| ())
    }

    async fn execute(
        &self,
        params: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<TaskResult> {
        let parts = self.check_command(params)?;
        let Some((head, args)) = parts.split_first() else {
            return Err(Error::invalid_arg("'command' parameter must not be empty"));
        };

        let mut command = tokio::process::Command::new(head);
        command.args(args);
        command.kill_on_drop(true);

        let output = tokio::select! {
            output = tokio::time::timeout(SCRIPT_TIMEOUT, command.output()) => {
                match output {
                    Ok(result) => result.map_err(|e| {
                        Error::invalid_arg(format!("failed to run '{head}': {e}"))
                    })?,
                    Err(_) => return Err(Error::Timeout(SCRIPT_TIMEOUT)),
                }
            }
            () = cancel.cancelled() => return Err(Error::Canceled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.success() {
            Ok(TaskResult::ok(stdout))
        } else {
            Ok(TaskResult {
                success: false,
                output: Some(stdout),
                error: Some(format!("exit status {}: {stderr}", output.status)),
            })
        }
    }
}

// ============ Tool executor ============

/// Invokes a named MCP tool. Arguments come from `arg_*` parameters; each
/// value is parsed as JSON when possible and falls back to a raw string.
pub struct ToolExecutor {
    mcp: Arc<McpManager>,
}

impl ToolExecutor {
    pub fn new(mcp: Arc<McpManager>) -> Self {
        Self { mcp }
    }
}

#[async_trait]
impl TaskExecutor for ToolExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::Tool
    }

    fn validate(&self, params: &HashMap<String, String>) -> Result<()> {
        let tool = params
            .get("tool")
            .ok_or_else(|| Error::invalid_arg("tool task requires a 'tool' parameter"))?;
        if tool.trim().is_empty() {
            return Err(Error::invalid_arg("'tool' parameter must not be empty"));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<TaskResult> {
        let tool = params
            .get("tool")
            .ok_or_else(|| Error::invalid_arg("missing 'tool' parameter"))?;

        let args = collect_tool_args(params);
        let result = self.mcp.call_tool(tool, args, cancel).await?;

        if result.success {
            Ok(TaskResult::ok(result.render()))
        } else {
            Ok(TaskResult::err(
                result.error.unwrap_or_else(|| "tool failed".to_string()),
            ))
        }
    }
}

/// Build the tool argument object from `arg_*` parameters.
fn collect_tool_args(params: &HashMap<String, String>) -> Value {
    let mut args = serde_json::Map::new();
    for (key, value) in params {
        if let Some(name) = key.strip_prefix("arg_") {
            let parsed = serde_json::from_str::<Value>(value)
                .unwrap_or_else(|_| Value::String(value.clone()));
            args.insert(name.to_string(), parsed);
        }
    }
    Value::Object(args)
}

/// Parse an optional numeric parameter with a default.
fn parse_param<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T> {
    match params.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::invalid_arg(format!("parameter '{key}' is not a valid number"))),
    }
}

fn parse_opt_param<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::invalid_arg(format!("parameter '{key}' is not a valid number"))),
    }
}
