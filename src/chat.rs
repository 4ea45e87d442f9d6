//! Multi-turn conversation layer.
//!
//! Layers bounded-history chat over the generation orchestrator: plain
//! chat, RAG-augmented chat (retrieval failures recover to empty context),
//! and tool-augmented chat. Streaming variants keep the history consistent
//! with what the user observed: if a stream errors mid-turn, the partial
//! content already emitted is appended before the error propagates.
//!
//! For RAG turns the *composed* message (context plus question) is what
//! lands in history; the stored transcript always reflects what was
//! actually sent to the model.

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};
use crate::generation::{self, ToolDispatcher};
use crate::message::{ConversationHistory, Role};
use crate::models::{Chunk, ExecutedToolCall, Metadata, ToolDefinition};
use crate::provider::{Embedder, GenerationOptions, Generator, StreamSink};
use crate::retrieve;
use crate::store::VectorStore;

/// Plain multi-turn chat: append the user message, generate over the full
/// list, append the assistant reply.
pub async fn chat(
    generator: &dyn Generator,
    history: &mut ConversationHistory,
    message: &str,
    opts: &GenerationOptions,
    cancel: &CancellationToken,
) -> Result<String> {
    if message.trim().is_empty() {
        return Err(Error::invalid_arg("message must not be empty"));
    }

    history.add_user(message);

    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(Error::Canceled),
        result = generator.generate_with_tools(history.messages(), &[], opts) => result?,
    };

    history.add_assistant(result.content.clone(), Vec::new());
    Ok(result.content)
}

/// RAG-augmented chat. Retrieval failures are recovered locally: the turn
/// proceeds with empty context and a warning.
#[allow(clippy::too_many_arguments)]
pub async fn chat_with_rag(
    embedder: &dyn Embedder,
    store: &VectorStore,
    generator: &dyn Generator,
    history: &mut ConversationHistory,
    message: &str,
    top_k: usize,
    filters: &Metadata,
    opts: &GenerationOptions,
    cancel: &CancellationToken,
) -> Result<(String, Vec<Chunk>)> {
    if message.trim().is_empty() {
        return Err(Error::invalid_arg("message must not be empty"));
    }

    let chunks = retrieve_recovering(embedder, store, message, top_k, filters).await;
    let composed = retrieve::compose(message, &chunks, false);

    history.add_user(composed);

    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(Error::Canceled),
        result = generator.generate_with_tools(history.messages(), &[], opts) => result?,
    };

    history.add_assistant(result.content.clone(), Vec::new());
    Ok((result.content, chunks))
}

/// Tool-augmented chat over the bounded tool loop.
#[allow(clippy::too_many_arguments)]
pub async fn chat_with_tools(
    generator: &dyn Generator,
    dispatcher: &dyn ToolDispatcher,
    history: &mut ConversationHistory,
    message: &str,
    tools: &[ToolDefinition],
    allowed: &[String],
    opts: &GenerationOptions,
    max_tool_calls: usize,
    cancel: &CancellationToken,
) -> Result<(String, Vec<ExecutedToolCall>)> {
    if message.trim().is_empty() {
        return Err(Error::invalid_arg("message must not be empty"));
    }

    history.add_user(message);
    run_tool_turn(
        generator,
        dispatcher,
        history,
        tools,
        allowed,
        opts,
        max_tool_calls,
        cancel,
    )
    .await
}

/// RAG retrieval, context composition, then the tool loop.
#[allow(clippy::too_many_arguments)]
pub async fn chat_with_rag_and_tools(
    embedder: &dyn Embedder,
    store: &VectorStore,
    generator: &dyn Generator,
    dispatcher: &dyn ToolDispatcher,
    history: &mut ConversationHistory,
    message: &str,
    top_k: usize,
    filters: &Metadata,
    tools: &[ToolDefinition],
    allowed: &[String],
    opts: &GenerationOptions,
    max_tool_calls: usize,
    cancel: &CancellationToken,
) -> Result<(String, Vec<Chunk>, Vec<ExecutedToolCall>)> {
    if message.trim().is_empty() {
        return Err(Error::invalid_arg("message must not be empty"));
    }

    let chunks = retrieve_recovering(embedder, store, message, top_k, filters).await;
    let composed = retrieve::compose(message, &chunks, false);

    history.add_user(composed);
    let (answer, executed) = run_tool_turn(
        generator,
        dispatcher,
        history,
        tools,
        allowed,
        opts,
        max_tool_calls,
        cancel,
    )
    .await?;

    Ok((answer, chunks, executed))
}

/// Streaming chat. On mid-turn failure the partial content already pushed
/// to the sink is appended to history so the transcript matches what the
/// user saw.
pub async fn stream_chat(
    generator: &dyn Generator,
    history: &mut ConversationHistory,
    message: &str,
    opts: &GenerationOptions,
    sink: StreamSink<'_>,
    cancel: &CancellationToken,
) -> Result<String> {
    if message.trim().is_empty() {
        return Err(Error::invalid_arg("message must not be empty"));
    }

    history.add_user(message);
    stream_turn(generator, history, opts, sink, cancel).await
}

/// Streaming RAG chat; same history invariants as [`stream_chat`].
#[allow(clippy::too_many_arguments)]
pub async fn stream_chat_with_rag(
    embedder: &dyn Embedder,
    store: &VectorStore,
    generator: &dyn Generator,
    history: &mut ConversationHistory,
    message: &str,
    top_k: usize,
    filters: &Metadata,
    opts: &GenerationOptions,
    sink: StreamSink<'_>,
    cancel: &CancellationToken,
) -> Result<(String, Vec<Chunk>)> {
    if message.trim().is_empty() {
        return Err(Error::invalid_arg("message must not be empty"));
    }

    let chunks = retrieve_recovering(embedder, store, message, top_k, filters).await;
    let composed = retrieve::compose(message, &chunks, false);

    history.add_user(composed);
    let answer = stream_turn(generator, history, opts, sink, cancel).await?;
    Ok((answer, chunks))
}

/// Retrieve context, recovering to empty on failure.
async fn retrieve_recovering(
    embedder: &dyn Embedder,
    store: &VectorStore,
    message: &str,
    top_k: usize,
    filters: &Metadata,
) -> Vec<Chunk> {
    match retrieve::retrieve(embedder, store, message, top_k, filters).await {
        Ok(chunks) => chunks,
        Err(e) => {
            warn!("retrieval failed, continuing with empty context: {e}");
            Vec::new()
        }
    }
}

/// One streamed assistant turn with partial-content recovery.
async fn stream_turn(
    generator: &dyn Generator,
    history: &mut ConversationHistory,
    opts: &GenerationOptions,
    sink: StreamSink<'_>,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut partial = String::new();

    let outcome = {
        let mut wrapped = |chunk: &str| {
            partial.push_str(chunk);
            sink(chunk);
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Canceled),
            result = generator.stream_with_tools(history.messages(), &[], opts, &mut wrapped) => result,
        }
    };

    match outcome {
        Ok(result) => {
            history.add_assistant(result.content.clone(), Vec::new());
            Ok(result.content)
        }
        Err(e) => {
            if !partial.is_empty() {
                history.add_assistant(partial, Vec::new());
            }
            Err(e)
        }
    }
}

/// Run the tool loop for one user turn and fold the produced messages
/// back into the history.
#[allow(clippy::too_many_arguments)]
async fn run_tool_turn(
    generator: &dyn Generator,
    dispatcher: &dyn ToolDispatcher,
    history: &mut ConversationHistory,
    tools: &[ToolDefinition],
    allowed: &[String],
    opts: &GenerationOptions,
    max_tool_calls: usize,
    cancel: &CancellationToken,
) -> Result<(String, Vec<ExecutedToolCall>)> {
    let base_len = history.len();
    let messages = history.messages().to_vec();

    let outcome = generation::generate_with_tools(
        generator,
        dispatcher,
        messages,
        tools,
        allowed,
        opts,
        max_tool_calls,
        cancel,
    )
    .await?;

    // Replay the tool exchange into history, then the final reply.
    for message in outcome.messages.iter().skip(base_len) {
        match message.role {
            Role::Assistant => {
                history.add_assistant(message.content.clone(), message.tool_calls.clone());
            }
            Role::Tool => {
                let id = message.tool_call_id.clone().unwrap_or_default();
                history.add_tool(message.content.clone(), id);
            }
            _ => {}
        }
    }
    history.add_assistant(outcome.result.content.clone(), Vec::new());

    Ok((outcome.result.content, outcome.executed))
}
