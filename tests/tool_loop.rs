//! Tool-loop scenarios over the generation orchestrator with scripted
//! providers and dispatchers.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use common::EchoToolGenerator;
use ragkit::error::Result;
use ragkit::generation::{self, ToolDispatcher};
use ragkit::message::{Message, Role};
use ragkit::models::{ToolDefinition, ToolResult};
use ragkit::provider::GenerationOptions;

/// Dispatcher that echoes its arguments and counts invocations.
struct CountingEchoDispatcher {
    invocations: AtomicUsize,
}

impl CountingEchoDispatcher {
    fn new() -> Self {
        Self {
            invocations: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ToolDispatcher for CountingEchoDispatcher {
    async fn dispatch(
        &self,
        _name: &str,
        args: Value,
        _cancel: &CancellationToken,
    ) -> Result<ToolResult> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(ToolResult::ok(args))
    }
}

fn echo_tools() -> Vec<ToolDefinition> {
    vec![ToolDefinition {
        name: "echo".to_string(),
        description: "Return the input".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }),
    }]
}

#[tokio::test]
async fn test_tool_loop_bounded_at_cap() {
    let generator = EchoToolGenerator::new();
    let dispatcher = CountingEchoDispatcher::new();

    let outcome = generation::generate_with_tools(
        &generator,
        &dispatcher,
        vec![Message::user("hi")],
        &echo_tools(),
        &["echo".to_string()],
        &GenerationOptions::default(),
        3,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    // Exactly three executed calls, all echo, deduped to one tool name.
    assert_eq!(outcome.executed.len(), 3);
    assert_eq!(dispatcher.invocations.load(Ordering::SeqCst), 3);
    let mut used: Vec<&str> = Vec::new();
    for call in &outcome.executed {
        if !used.contains(&call.function_name.as_str()) {
            used.push(&call.function_name);
        }
    }
    assert_eq!(used, vec!["echo"]);

    // The final content is the provider's last reply, surfaced unchanged
    // with its unexecuted tool request.
    assert_eq!(outcome.result.content, "calling echo");
    assert_eq!(outcome.result.tool_calls.len(), 1);
}

#[tokio::test]
async fn test_denied_tools_never_invoked() {
    let generator = EchoToolGenerator::new();
    let dispatcher = CountingEchoDispatcher::new();

    let outcome = generation::generate_with_tools(
        &generator,
        &dispatcher,
        vec![Message::user("hi")],
        &echo_tools(),
        &[], // empty allowed list denies everything
        &GenerationOptions::default(),
        3,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(dispatcher.invocations.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.executed.len(), 3);
    for call in &outcome.executed {
        assert!(!call.success);
        assert_eq!(call.error.as_deref(), Some("not allowed"));
    }
}

#[tokio::test]
async fn test_transcript_pairs_tool_messages_with_calls() {
    let generator = EchoToolGenerator::new();
    let dispatcher = CountingEchoDispatcher::new();

    let outcome = generation::generate_with_tools(
        &generator,
        &dispatcher,
        vec![Message::user("hi")],
        &echo_tools(),
        &["echo".to_string()],
        &GenerationOptions::default(),
        2,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    // Every assistant message with tool calls is followed, in order, by
    // exactly one tool message per call with a matching id.
    let messages = &outcome.messages;
    for (i, message) in messages.iter().enumerate() {
        if message.role == Role::Assistant && !message.tool_calls.is_empty() {
            for (offset, call) in message.tool_calls.iter().enumerate() {
                let follower = &messages[i + 1 + offset];
                assert_eq!(follower.role, Role::Tool);
                assert_eq!(follower.tool_call_id.as_deref(), Some(call.id.as_str()));
            }
        }
    }
}

#[tokio::test]
async fn test_streaming_tool_loop_emits_each_turn() {
    let generator = EchoToolGenerator::new();
    let dispatcher = CountingEchoDispatcher::new();
    let mut streamed = String::new();

    let outcome = generation::stream_with_tools(
        &generator,
        &dispatcher,
        vec![Message::user("hi")],
        &echo_tools(),
        &["echo".to_string()],
        &GenerationOptions::default(),
        2,
        &mut |chunk: &str| streamed.push_str(chunk),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.executed.len(), 2);
    // Three provider turns streamed: two tool turns plus the capped one.
    assert_eq!(streamed, "calling echocalling echocalling echo");
}
