//! Ollama provider: embeddings via `/api/embed`, generation via `/api/chat`.
//!
//! Requires a running Ollama instance with the configured models pulled
//! (e.g. `ollama pull nomic-embed-text`). Ollama does not assign tool-call
//! ids, so this backend synthesizes sequential ids for the tool loop.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use super::{backoff_delay, retryable_status};
use crate::config::OllamaConfig;
use crate::error::{Error, Result};
use crate::message::{Message, Role};
use crate::models::{ToolCall, ToolDefinition};
use crate::provider::{
    Embedder, GenerationOptions, GenerationResult, Generator, StreamSink, ToolChoice,
};

const PROVIDER_NAME: &str = "ollama";

/// Ollama backend implementing both provider traits.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    llm_model: String,
    embedding_model: String,
    embedding_dims: usize,
    max_retries: u32,
}

impl OllamaProvider {
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::embedding(PROVIDER_NAME, e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            llm_model: config.llm_model.clone(),
            embedding_model: config.embedding_model.clone(),
            embedding_dims: config.embedding_dims,
            max_retries: config.max_retries,
        })
    }

    fn chat_body(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &GenerationOptions,
        stream: bool,
    ) -> Value {
        let wire_messages: Vec<Value> = messages.iter().map(message_to_wire).collect();

        let mut body = json!({
            "model": self.llm_model,
            "messages": wire_messages,
            "stream": stream,
            "think": opts.think,
            "options": {
                "temperature": opts.temperature,
                "num_predict": opts.max_tokens,
            },
        });

        // Ollama has no tool_choice knob; `None` is expressed by sending
        // no tool definitions at all.
        if !tools.is_empty() && opts.tool_choice != ToolChoice::None {
            body["tools"] = Value::Array(tools.iter().map(tool_to_wire).collect());
        }

        body
    }

    async fn post_chat(&self, body: &Value) -> Result<Value> {
        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                Error::generation(
                    PROVIDER_NAME,
                    format!("connection error (is Ollama running at {}?): {e}", self.base_url),
                )
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(Error::generation(
                PROVIDER_NAME,
                format!("API error {status}: {body_text}"),
            ));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| Error::generation(PROVIDER_NAME, e.to_string()))
    }
}

/// Convert an internal message to the Ollama chat wire shape.
fn message_to_wire(msg: &Message) -> Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let mut wire = json!({ "role": role, "content": msg.content });

    if !msg.tool_calls.is_empty() {
        wire["tool_calls"] = Value::Array(
            msg.tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "function": {
                            "name": tc.function_name,
                            "arguments": tc.arguments,
                        }
                    })
                })
                .collect(),
        );
    }

    wire
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

/// Pull tool calls out of an Ollama chat message, assigning sequential ids.
fn parse_tool_calls(message: &Value, id_offset: usize) -> Vec<ToolCall> {
    let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
        return Vec::new();
    };

    calls
        .iter()
        .enumerate()
        .filter_map(|(i, call)| {
            let function = call.get("function")?;
            let name = function.get("name")?.as_str()?.to_string();
            let arguments = function
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            Some(ToolCall {
                id: format!("call_{}", id_offset + i),
                function_name: name,
                arguments,
            })
        })
        .collect()
}

#[async_trait]
impl Embedder for OllamaProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn dims(&self) -> usize {
        self.embedding_dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({
            "model": self.embedding_model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let resp = self
                .client
                .post(format!("{}/api/embed", self.base_url))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response
                            .json()
                            .await
                            .map_err(|e| Error::embedding(PROVIDER_NAME, e.to_string()))?;
                        return parse_embed_response(&json);
                    }

                    if retryable_status(status) {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(Error::embedding(
                            PROVIDER_NAME,
                            format!("API error {status}: {body_text}"),
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(Error::embedding(
                        PROVIDER_NAME,
                        format!("API error {status}: {body_text}"),
                    ));
                }
                Err(e) => {
                    last_err = Some(Error::embedding(
                        PROVIDER_NAME,
                        format!("connection error (is Ollama running at {}?): {e}", self.base_url),
                    ));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::embedding(PROVIDER_NAME, "embedding failed after retries")))
    }

    async fn health(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("ollama unreachable: {e}")))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Unavailable(format!(
                "ollama health probe returned {}",
                resp.status()
            )))
        }
    }
}

fn parse_embed_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::embedding(PROVIDER_NAME, "missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| Error::embedding(PROVIDER_NAME, "embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }
    Ok(result)
}

#[async_trait]
impl Generator for OllamaProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn generate(&self, prompt: &str, opts: &GenerationOptions) -> Result<String> {
        if prompt.trim().is_empty() {
            return Err(Error::invalid_arg("prompt must not be empty"));
        }
        let messages = [Message::user(prompt)];
        let result = self.generate_with_tools(&messages, &[], opts).await?;
        Ok(result.content)
    }

    async fn stream(
        &self,
        prompt: &str,
        opts: &GenerationOptions,
        sink: StreamSink<'_>,
    ) -> Result<()> {
        if prompt.trim().is_empty() {
            return Err(Error::invalid_arg("prompt must not be empty"));
        }
        let messages = [Message::user(prompt)];
        self.stream_with_tools(&messages, &[], opts, sink).await?;
        Ok(())
    }

    async fn generate_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &GenerationOptions,
    ) -> Result<GenerationResult> {
        let body = self.chat_body(messages, tools, opts, false);
        let json = self.post_chat(&body).await?;

        let message = json.get("message").cloned().unwrap_or_else(|| json!({}));
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tool_calls = parse_tool_calls(&message, 0);

        debug!(
            tool_count = tool_calls.len(),
            "ollama chat turn complete"
        );

        Ok(GenerationResult {
            finished: tool_calls.is_empty(),
            content,
            tool_calls,
        })
    }

    async fn stream_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &GenerationOptions,
        sink: StreamSink<'_>,
    ) -> Result<GenerationResult> {
        let body = self.chat_body(messages, tools, opts, true);

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::generation(
                    PROVIDER_NAME,
                    format!("connection error (is Ollama running at {}?): {e}", self.base_url),
                )
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(Error::generation(
                PROVIDER_NAME,
                format!("API error {status}: {body_text}"),
            ));
        }

        // Ollama streams newline-delimited JSON objects.
        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        while let Some(item) = stream.next().await {
            let bytes = item.map_err(|e| Error::generation(PROVIDER_NAME, e.to_string()))?;
            buf.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buf.find('\n') {
                let line: String = buf.drain(..=pos).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(chunk) = serde_json::from_str::<Value>(line) else {
                    continue;
                };
                if let Some(message) = chunk.get("message") {
                    if let Some(delta) = message.get("content").and_then(Value::as_str) {
                        if !delta.is_empty() {
                            content.push_str(delta);
                            sink(delta);
                        }
                    }
                    let parsed = parse_tool_calls(message, tool_calls.len());
                    tool_calls.extend(parsed);
                }
            }
        }

        Ok(GenerationResult {
            finished: tool_calls.is_empty(),
            content,
            tool_calls,
        })
    }

    async fn health(&self) -> Result<()> {
        Embedder::health(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_embed_response() {
        let json = json!({"embeddings": [[1.0, 2.0], [3.0, 4.0]]});
        let vectors = parse_embed_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);

        let bad = json!({"nope": true});
        assert!(parse_embed_response(&bad).is_err());
    }

    #[test]
    fn test_parse_tool_calls_assigns_ids() {
        let message = json!({
            "content": "",
            "tool_calls": [
                {"function": {"name": "echo", "arguments": {"text": "hi"}}},
                {"function": {"name": "search", "arguments": {"q": "rust"}}},
            ]
        });
        let calls = parse_tool_calls(&message, 2);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_2");
        assert_eq!(calls[0].function_name, "echo");
        assert_eq!(calls[1].id, "call_3");
        assert_eq!(calls[1].arguments, json!({"q": "rust"}));
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = Message::assistant_tool_calls(
            "",
            vec![ToolCall {
                id: "call_0".into(),
                function_name: "echo".into(),
                arguments: json!({"text": "hi"}),
            }],
        );
        let wire = message_to_wire(&msg);
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "echo");
    }

    #[test]
    fn test_chat_body_omits_tools_when_choice_none() {
        let provider = OllamaProvider::new(&OllamaConfig::default()).unwrap();
        let opts = GenerationOptions {
            tool_choice: ToolChoice::None,
            ..GenerationOptions::default()
        };
        let tools = [ToolDefinition {
            name: "echo".into(),
            description: "Echo".into(),
            parameters: json!({"type": "object"}),
        }];
        let body = provider.chat_body(&[Message::user("hi")], &tools, &opts, false);
        assert!(body.get("tools").is_none());

        let auto = GenerationOptions::default();
        let body = provider.chat_body(&[Message::user("hi")], &tools, &auto, false);
        assert!(body.get("tools").is_some());
    }
}
