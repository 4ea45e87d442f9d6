//! The platform facade.
//!
//! [`RagClient`] composes the store, providers, tool manager, and task
//! scheduler behind one handle. It owns none of their storage exclusively;
//! each component keeps its own discipline (single-writer store, manager-
//! owned process handles, scheduler-owned task tables) and the facade wires
//! them together by reference.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chat;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executors::{IngestExecutor, QueryExecutor, ScriptExecutor, ToolExecutor};
use crate::generation;
use crate::ingest;
use crate::mcp::McpManager;
use crate::message::ConversationHistory;
use crate::models::{
    Chunk, Document, ExecutedToolCall, IngestRequest, IngestResponse, Metadata, QueryRequest,
    QueryResponse, ToolDefinition,
};
use crate::provider::{self, Embedder, GenerationOptions, Generator, StreamSink};
use crate::retrieve;
use crate::scheduler::{Scheduler, TaskExecutor};
use crate::store::VectorStore;

/// Store and provider health, for status output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub document_count: i64,
    pub chunk_count: i64,
    pub dimension: Option<usize>,
    pub embedder: String,
    pub generator: String,
    pub mcp_enabled: bool,
    pub scheduler_enabled: bool,
}

/// The composed RAG platform client.
pub struct RagClient {
    config: Arc<Config>,
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    mcp: Arc<McpManager>,
    scheduler: Scheduler,
}

impl RagClient {
    /// Build a client from configuration, instantiating the configured
    /// provider backends.
    pub async fn new(config: Config) -> Result<Self> {
        let store = Arc::new(VectorStore::open(&config.store.path).await?);
        let embedder: Arc<dyn Embedder> = Arc::from(provider::create_embedder(&config)?);
        let generator: Arc<dyn Generator> = Arc::from(provider::create_generator(&config)?);
        Self::with_components(config, store, embedder, generator).await
    }

    /// Build a client around injected components. This is the seam used
    /// by tests and embedders of the library that bring their own
    /// backends.
    pub async fn with_components(
        config: Config,
        store: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let mcp = Arc::new(McpManager::new(&config.mcp));

        let executors: Vec<Arc<dyn TaskExecutor>> = vec![
            Arc::new(QueryExecutor::new(
                store.clone(),
                embedder.clone(),
                generator.clone(),
                config.clone(),
            )),
            Arc::new(IngestExecutor::new(
                store.clone(),
                embedder.clone(),
                Some(generator.clone()),
                config.clone(),
            )),
            Arc::new(ScriptExecutor::new(config.scheduler.allowed_commands.clone())),
            Arc::new(ToolExecutor::new(mcp.clone())),
        ];

        let scheduler = Scheduler::new(
            store.pool().clone(),
            config.scheduler.clone(),
            executors,
        )
        .await?;

        Ok(Self {
            config,
            store,
            embedder,
            generator,
            mcp,
            scheduler,
        })
    }

    /// Launch the background machinery enabled by configuration: MCP
    /// servers and the scheduler ticker.
    pub async fn start(&self) -> Result<()> {
        if self.config.mcp.enabled {
            self.mcp.start_all().await?;
        }
        if self.config.scheduler.enabled {
            self.scheduler.start().await;
        }
        info!("platform started");
        Ok(())
    }

    /// Stop the scheduler and every tool server. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.stop().await;
        if self.config.mcp.enabled {
            self.mcp.stop_all().await?;
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    pub fn mcp(&self) -> &McpManager {
        &self.mcp
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Ingest one source.
    pub async fn ingest(
        &self,
        request: &IngestRequest,
        cancel: &CancellationToken,
    ) -> Result<IngestResponse> {
        ingest::run_ingest(
            &self.store,
            self.embedder.as_ref(),
            Some(self.generator.as_ref()),
            &self.config,
            request,
            cancel,
        )
        .await
    }

    /// Answer a query: retrieve, compose, generate, optionally looping
    /// through tools.
    pub async fn query(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse> {
        request.validate()?;
        let started = Instant::now();

        let chunks = retrieve::retrieve(
            self.embedder.as_ref(),
            &self.store,
            &request.query,
            request.top_k,
            &request.filters,
        )
        .await?;
        let prompt = retrieve::compose(&request.query, &chunks, request.show_thinking);

        let opts = GenerationOptions {
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            think: request.show_thinking,
            ..GenerationOptions::default()
        };

        let mut response = if request.tools_enabled {
            let tools = self.presented_tools(&request.allowed_tools).await?;
            let messages = vec![crate::message::Message::user(prompt)];
            let outcome = generation::generate_with_tools(
                self.generator.as_ref(),
                self.mcp.as_ref(),
                messages,
                &tools,
                &request.allowed_tools,
                &opts,
                request.max_tool_calls,
                cancel,
            )
            .await?;

            QueryResponse {
                answer: outcome.result.content,
                tools_used: tools_used(&outcome.executed),
                tool_calls: outcome.executed,
                ..QueryResponse::default()
            }
        } else {
            let answer =
                generation::generate(self.generator.as_ref(), &prompt, &opts, cancel).await?;
            QueryResponse {
                answer,
                ..QueryResponse::default()
            }
        };

        if request.show_sources {
            response.sources = chunks;
        }
        response.elapsed_ms = started.elapsed().as_millis() as u64;

        debug!(
            elapsed_ms = response.elapsed_ms,
            tool_calls = response.tool_calls.len(),
            "query answered"
        );
        Ok(response)
    }

    /// Streaming twin of [`query`](Self::query): answer chunks go to the
    /// sink as they arrive; the returned response carries the full answer.
    pub async fn query_stream(
        &self,
        request: &QueryRequest,
        sink: StreamSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse> {
        request.validate()?;
        let started = Instant::now();

        let chunks = retrieve::retrieve(
            self.embedder.as_ref(),
            &self.store,
            &request.query,
            request.top_k,
            &request.filters,
        )
        .await?;
        let prompt = retrieve::compose(&request.query, &chunks, request.show_thinking);

        let opts = GenerationOptions {
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            think: request.show_thinking,
            ..GenerationOptions::default()
        };

        let mut response = if request.tools_enabled {
            let tools = self.presented_tools(&request.allowed_tools).await?;
            let messages = vec![crate::message::Message::user(prompt)];
            let outcome = generation::stream_with_tools(
                self.generator.as_ref(),
                self.mcp.as_ref(),
                messages,
                &tools,
                &request.allowed_tools,
                &opts,
                request.max_tool_calls,
                sink,
                cancel,
            )
            .await?;

            QueryResponse {
                answer: outcome.result.content,
                tools_used: tools_used(&outcome.executed),
                tool_calls: outcome.executed,
                ..QueryResponse::default()
            }
        } else {
            let mut answer = String::new();
            {
                let mut wrapped = |chunk: &str| {
                    answer.push_str(chunk);
                    sink(chunk);
                };
                generation::stream(self.generator.as_ref(), &prompt, &opts, &mut wrapped, cancel)
                    .await?;
            }
            QueryResponse {
                answer,
                ..QueryResponse::default()
            }
        };

        if request.show_sources {
            response.sources = chunks;
        }
        response.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(response)
    }

    /// Plain multi-turn chat over a caller-held history.
    pub async fn chat(
        &self,
        history: &mut ConversationHistory,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        chat::chat(
            self.generator.as_ref(),
            history,
            message,
            &self.default_opts(),
            cancel,
        )
        .await
    }

    /// RAG-augmented chat; retrieval failures degrade to empty context.
    pub async fn chat_with_rag(
        &self,
        history: &mut ConversationHistory,
        message: &str,
        filters: &Metadata,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<Chunk>)> {
        chat::chat_with_rag(
            self.embedder.as_ref(),
            &self.store,
            self.generator.as_ref(),
            history,
            message,
            self.config.query.top_k,
            filters,
            &self.default_opts(),
            cancel,
        )
        .await
    }

    /// Retrieval, then the tool loop, over a caller-held history.
    pub async fn chat_with_rag_and_tools(
        &self,
        history: &mut ConversationHistory,
        message: &str,
        filters: &Metadata,
        allowed_tools: &[String],
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<Chunk>, Vec<ExecutedToolCall>)> {
        let tools = self.presented_tools(allowed_tools).await?;
        chat::chat_with_rag_and_tools(
            self.embedder.as_ref(),
            &self.store,
            self.generator.as_ref(),
            self.mcp.as_ref(),
            history,
            message,
            self.config.query.top_k,
            filters,
            &tools,
            allowed_tools,
            &self.default_opts(),
            self.config.query.max_tool_calls,
            cancel,
        )
        .await
    }

    /// Streaming chat; partial content is kept in history on failure.
    pub async fn stream_chat(
        &self,
        history: &mut ConversationHistory,
        message: &str,
        sink: StreamSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        chat::stream_chat(
            self.generator.as_ref(),
            history,
            message,
            &self.default_opts(),
            sink,
            cancel,
        )
        .await
    }

    /// Streaming RAG chat.
    pub async fn stream_chat_with_rag(
        &self,
        history: &mut ConversationHistory,
        message: &str,
        filters: &Metadata,
        sink: StreamSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<Chunk>)> {
        chat::stream_chat_with_rag(
            self.embedder.as_ref(),
            &self.store,
            self.generator.as_ref(),
            history,
            message,
            self.config.query.top_k,
            filters,
            &self.default_opts(),
            sink,
            cancel,
        )
        .await
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        self.store.list_documents().await
    }

    pub async fn get_document(&self, id: &str) -> Result<Document> {
        self.store.get_document(id).await
    }

    pub async fn delete_document(&self, id: &str) -> Result<()> {
        self.store.delete_document(id).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.store.reset().await
    }

    /// Store counts and component identities for status output.
    pub async fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            document_count: self.store.document_count().await?,
            chunk_count: self.store.chunk_count().await?,
            dimension: self.store.dimension().await?,
            embedder: self.embedder.name().to_string(),
            generator: self.generator.name().to_string(),
            mcp_enabled: self.config.mcp.enabled,
            scheduler_enabled: self.config.scheduler.enabled,
        })
    }

    /// Probe the provider backends.
    pub async fn health(&self) -> Result<()> {
        self.embedder.health().await?;
        self.generator.health().await?;
        Ok(())
    }

    fn default_opts(&self) -> GenerationOptions {
        GenerationOptions {
            temperature: self.config.query.temperature,
            max_tokens: self.config.query.max_tokens,
            ..GenerationOptions::default()
        }
    }

    /// The tool definitions presented to the model: the discovered set
    /// restricted to the allowed list. With MCP disabled, no tools are
    /// presented (the loop then denies anything the model invents).
    async fn presented_tools(&self, allowed: &[String]) -> Result<Vec<ToolDefinition>> {
        match self.mcp.list_tools().await {
            Ok(tools) => Ok(tools
                .iter()
                .filter(|tool| allowed.is_empty() || allowed.contains(&tool.name))
                .map(|tool| tool.to_definition())
                .collect()),
            Err(Error::Unavailable(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

/// Distinct invoked tool names in first-use order. Denied calls never
/// ran, so they do not count as used.
fn tools_used(executed: &[ExecutedToolCall]) -> Vec<String> {
    let mut used = Vec::new();
    for call in executed {
        if call.error.as_deref() == Some("not allowed") {
            continue;
        }
        if !used.contains(&call.function_name) {
            used.push(call.function_name.clone());
        }
    }
    used
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn executed(name: &str, error: Option<&str>) -> ExecutedToolCall {
        ExecutedToolCall {
            id: "call".to_string(),
            function_name: name.to_string(),
            arguments: json!({}),
            result: None,
            success: error.is_none(),
            error: error.map(str::to_string),
            elapsed_ms: 0,
        }
    }

    #[test]
    fn test_tools_used_dedupes_and_skips_denied() {
        let calls = vec![
            executed("echo", None),
            executed("echo", None),
            executed("search", Some("not allowed")),
            executed("fetch", Some("boom")),
        ];
        assert_eq!(tools_used(&calls), vec!["echo", "fetch"]);
    }
}
