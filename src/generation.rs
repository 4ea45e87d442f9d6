//! Generation orchestration: plain, streaming, and tool-loop generation.
//!
//! The tool loop drives the model ↔ tool round-trip: one provider turn,
//! execute any requested tool calls, append results, repeat. The loop is
//! bounded by `max_tool_calls`; once the cap is reached the last provider
//! response is returned unchanged so the model's own tool request stays
//! visible to the caller for audit.
//!
//! Ordering guarantees within a request: messages append monotonically,
//! a turn's streaming completes before its tool execution begins, and a
//! turn's tool results append in call order even when the calls execute
//! concurrently.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::models::{ExecutedToolCall, ToolCall, ToolDefinition, ToolResult};
use crate::provider::{GenerationOptions, GenerationResult, Generator, StreamSink};

/// Executes tool calls on behalf of the generation loop.
///
/// [`crate::mcp::McpManager`] is the production dispatcher; tests plug in
/// scripted ones.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        name: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult>;
}

#[async_trait]
impl ToolDispatcher for crate::mcp::McpManager {
    async fn dispatch(
        &self,
        name: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult> {
        self.call_tool(name, args, cancel).await
    }
}

/// Outcome of a tool-loop generation.
#[derive(Debug, Default)]
pub struct ToolLoopOutcome {
    /// The last provider response (content plus any un-executed tool calls).
    pub result: GenerationResult,
    /// The full message transcript including tool exchanges.
    pub messages: Vec<Message>,
    /// Every tool call executed, in execution order.
    pub executed: Vec<ExecutedToolCall>,
}

/// Plain one-shot generation with cooperative cancellation.
pub async fn generate(
    generator: &dyn Generator,
    prompt: &str,
    opts: &GenerationOptions,
    cancel: &CancellationToken,
) -> Result<String> {
    if cancel.is_cancelled() {
        return Err(Error::Canceled);
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Canceled),
        result = generator.generate(prompt, opts) => result,
    }
}

/// Streaming generation with cooperative cancellation. Partial output
/// already pushed to the sink stays with the caller on cancellation.
pub async fn stream(
    generator: &dyn Generator,
    prompt: &str,
    opts: &GenerationOptions,
    sink: StreamSink<'_>,
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Canceled);
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Canceled),
        result = generator.stream(prompt, opts, sink) => result,
    }
}

/// Run the bounded tool loop over a message list.
///
/// `allowed` is the set of tool names the model may actually invoke; a
/// call outside it produces a denied result without invocation. Duplicate
/// tool-call ids within one turn are dropped on first occurrence.
pub async fn generate_with_tools(
    generator: &dyn Generator,
    dispatcher: &dyn ToolDispatcher,
    mut messages: Vec<Message>,
    tools: &[ToolDefinition],
    allowed: &[String],
    opts: &GenerationOptions,
    max_tool_calls: usize,
    cancel: &CancellationToken,
) -> Result<ToolLoopOutcome> {
    let mut executed: Vec<ExecutedToolCall> = Vec::new();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        let result = tokio::select! {
            result = generator.generate_with_tools(&messages, tools, opts) => result?,
            () = cancel.cancelled() => return Err(Error::Canceled),
        };

        if result.tool_calls.is_empty() || executed.len() >= max_tool_calls {
            return Ok(ToolLoopOutcome {
                result,
                messages,
                executed,
            });
        }

        let calls = dedup_by_id(result.tool_calls.clone());
        messages.push(Message::assistant_tool_calls(
            result.content.clone(),
            calls.clone(),
        ));

        // Only the calls that fit under the cap run; the rest of the turn
        // is dropped and surfaced through the next provider response.
        let budget = max_tool_calls - executed.len();
        let to_run: Vec<ToolCall> = calls.into_iter().take(budget).collect();

        let batch = run_calls(dispatcher, &to_run, allowed, cancel).await?;

        for (call, (tool_result, elapsed_ms)) in to_run.iter().zip(batch) {
            messages.push(Message::tool(call.id.clone(), tool_result.render()));
            executed.push(ExecutedToolCall {
                id: call.id.clone(),
                function_name: call.function_name.clone(),
                arguments: call.arguments.clone(),
                result: tool_result.data.clone(),
                success: tool_result.success,
                error: tool_result.error.clone(),
                elapsed_ms,
            });
        }

        debug!(
            executed = executed.len(),
            cap = max_tool_calls,
            "tool loop iteration complete"
        );
    }
}

/// Streaming twin of [`generate_with_tools`]. Each turn's text deltas are
/// pushed to the sink before that turn's tools run.
#[allow(clippy::too_many_arguments)]
pub async fn stream_with_tools(
    generator: &dyn Generator,
    dispatcher: &dyn ToolDispatcher,
    mut messages: Vec<Message>,
    tools: &[ToolDefinition],
    allowed: &[String],
    opts: &GenerationOptions,
    max_tool_calls: usize,
    sink: StreamSink<'_>,
    cancel: &CancellationToken,
) -> Result<ToolLoopOutcome> {
    let mut executed: Vec<ExecutedToolCall> = Vec::new();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        let result = tokio::select! {
            result = generator.stream_with_tools(&messages, tools, opts, sink) => result?,
            () = cancel.cancelled() => return Err(Error::Canceled),
        };

        if result.tool_calls.is_empty() || executed.len() >= max_tool_calls {
            return Ok(ToolLoopOutcome {
                result,
                messages,
                executed,
            });
        }

        let calls = dedup_by_id(result.tool_calls.clone());
        messages.push(Message::assistant_tool_calls(
            result.content.clone(),
            calls.clone(),
        ));

        let budget = max_tool_calls - executed.len();
        let to_run: Vec<ToolCall> = calls.into_iter().take(budget).collect();

        let batch = run_calls(dispatcher, &to_run, allowed, cancel).await?;

        for (call, (tool_result, elapsed_ms)) in to_run.iter().zip(batch) {
            messages.push(Message::tool(call.id.clone(), tool_result.render()));
            executed.push(ExecutedToolCall {
                id: call.id.clone(),
                function_name: call.function_name.clone(),
                arguments: call.arguments.clone(),
                result: tool_result.data.clone(),
                success: tool_result.success,
                error: tool_result.error.clone(),
                elapsed_ms,
            });
        }
    }
}

/// Execute one turn's tool calls concurrently, preserving call order in
/// the returned list. Tool failures become denied/failed results rather
/// than loop errors; only cancellation aborts the turn.
async fn run_calls(
    dispatcher: &dyn ToolDispatcher,
    calls: &[ToolCall],
    allowed: &[String],
    cancel: &CancellationToken,
) -> Result<Vec<(ToolResult, u64)>> {
    let futures = calls.iter().map(|call| async move {
        if !allowed.contains(&call.function_name) {
            return Ok((ToolResult::err("not allowed"), 0));
        }

        let start = Instant::now();
        let outcome = dispatcher
            .dispatch(&call.function_name, call.arguments.clone(), cancel)
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => Ok((result, elapsed_ms)),
            Err(Error::Canceled) => Err(Error::Canceled),
            Err(e) => Ok((ToolResult::err(e.to_string()), elapsed_ms)),
        }
    });

    futures_util::future::join_all(futures).await.into_iter().collect()
}

/// Drop duplicate tool-call ids, keeping the first occurrence.
fn dedup_by_id(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = std::collections::HashSet::new();
    calls
        .into_iter()
        .filter(|call| seen.insert(call.id.clone()))
        .collect()
}
