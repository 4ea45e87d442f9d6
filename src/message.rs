//! Provider-agnostic chat message model and bounded conversation history.
//!
//! Messages form a tagged union over the four chat roles. A `tool` message
//! always carries the id of the assistant tool call it answers; an assistant
//! message carrying tool calls may have empty content.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::ToolCall;

/// Role of a chat message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant response.
    Assistant,
    /// Tool result.
    Tool,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender.
    pub role: Role,
    /// Message content.
    pub content: String,
    /// Tool calls requested by the assistant (only for `Role::Assistant`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Tool call id this message responds to (only for `Role::Tool`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Creates an assistant message with plain text content.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Creates an assistant message carrying tool calls. Content may be empty.
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Creates a tool result message answering a prior assistant tool call.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Bounded multi-turn conversation history.
///
/// Index 0 is always the system message. Trimming preserves it and drops
/// the oldest remaining messages first.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    messages: Vec<Message>,
    max_history: usize,
}

impl ConversationHistory {
    /// Creates a history seeded with a system prompt.
    ///
    /// `max_history` must be at least 2 (system plus one exchange slot).
    pub fn new(system_prompt: impl Into<String>, max_history: usize) -> Result<Self> {
        if max_history < 2 {
            return Err(Error::invalid_arg("max_history must be >= 2"));
        }
        Ok(Self {
            messages: vec![Message::system(system_prompt)],
            max_history,
        })
    }

    /// All messages in order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Current message count.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a user message, then trim.
    pub fn add_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
        self.trim();
    }

    /// Append an assistant message, optionally carrying tool calls, then trim.
    pub fn add_assistant(&mut self, content: impl Into<String>, tool_calls: Vec<ToolCall>) {
        if tool_calls.is_empty() {
            self.messages.push(Message::assistant(content));
        } else {
            self.messages
                .push(Message::assistant_tool_calls(content, tool_calls));
        }
        self.trim();
    }

    /// Append a tool result message, then trim.
    pub fn add_tool(&mut self, content: impl Into<String>, tool_call_id: impl Into<String>) {
        self.messages.push(Message::tool(tool_call_id, content));
        self.trim();
    }

    /// Drop the oldest non-system messages until `len <= max_history`.
    pub fn trim(&mut self) {
        while self.messages.len() > self.max_history {
            // Index 0 is the system message and is never dropped.
            self.messages.remove(1);
        }
    }
}
