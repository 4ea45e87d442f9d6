//! OpenAI-compatible provider: chat completions and embeddings.
//!
//! Works against OpenAI itself or any server that speaks the same wire
//! format (LM Studio, vLLM, local proxies) via the configurable base URL.
//! Streaming uses server-sent events; tool-call deltas are accumulated by
//! index until the stream ends.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use super::{backoff_delay, retryable_status};
use crate::config::OpenAiConfig;
use crate::error::{Error, Result};
use crate::message::{Message, Role};
use crate::models::{ToolCall, ToolDefinition};
use crate::provider::{
    Embedder, GenerationOptions, GenerationResult, Generator, StreamSink, ToolChoice,
};

const PROVIDER_NAME: &str = "openai";

/// Backend for any OpenAI-compatible endpoint.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    llm_model: String,
    embedding_model: String,
    embedding_dims: usize,
    max_retries: u32,
}

impl OpenAiCompatProvider {
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::embedding(PROVIDER_NAME, e.to_string()))?;

        // A missing key is fine for local servers; requests just go out
        // without an Authorization header.
        let api_key = if config.api_key_env.is_empty() {
            None
        } else {
            std::env::var(&config.api_key_env).ok()
        };

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            llm_model: config.llm_model.clone(),
            embedding_model: config.embedding_model.clone(),
            embedding_dims: config.embedding_dims,
            max_retries: config.max_retries,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(ref key) = self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        builder
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
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
        });
        if stream {
            body["stream"] = json!(true);
        }

        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(tool_to_wire).collect());
            body["tool_choice"] = tool_choice_to_wire(&opts.tool_choice);
        }

        body
    }
}

fn message_to_wire(msg: &Message) -> Value {
    match msg.role {
        Role::System => json!({ "role": "system", "content": msg.content }),
        Role::User => json!({ "role": "user", "content": msg.content }),
        Role::Assistant => {
            let mut wire = json!({ "role": "assistant", "content": msg.content });
            if !msg.tool_calls.is_empty() {
                wire["tool_calls"] = Value::Array(
                    msg.tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.function_name,
                                    // The wire carries arguments as a JSON string.
                                    "arguments": tc.arguments.to_string(),
                                }
                            })
                        })
                        .collect(),
                );
            }
            wire
        }
        Role::Tool => json!({
            "role": "tool",
            "content": msg.content,
            "tool_call_id": msg.tool_call_id.as_deref().unwrap_or_default(),
        }),
    }
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

fn tool_choice_to_wire(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Required => json!("required"),
        ToolChoice::None => json!("none"),
        ToolChoice::Function(name) => json!({
            "type": "function",
            "function": { "name": name }
        }),
    }
}

/// Parse tool calls from a non-streaming chat completion message.
fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
        return Vec::new();
    };

    calls
        .iter()
        .filter_map(|call| {
            let id = call.get("id").and_then(Value::as_str)?.to_string();
            let function = call.get("function")?;
            let name = function.get("name")?.as_str()?.to_string();
            let arguments = function
                .get("arguments")
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(|| json!({}));
            Some(ToolCall {
                id,
                function_name: name,
                arguments,
            })
        })
        .collect()
}

/// Extract the JSON payload from one SSE line, if it carries one.
fn parse_sse_line(line: &str) -> Option<Value> {
    let payload = line.strip_prefix("data: ")?;
    if payload == "[DONE]" {
        return None;
    }
    serde_json::from_str(payload).ok()
}

/// Accumulator assembling tool calls from streaming deltas.
///
/// OpenAI streams tool calls as indexed fragments: the id and name arrive
/// with the first fragment, argument text accumulates across fragments.
#[derive(Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<usize, (String, String, String)>,
}

impl ToolCallAccumulator {
    fn feed(&mut self, delta_calls: &[Value]) {
        for call in delta_calls {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            let entry = self.calls.entry(index).or_default();

            if let Some(id) = call.get("id").and_then(Value::as_str) {
                entry.0 = id.to_string();
            }
            if let Some(function) = call.get("function") {
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    entry.1 = name.to_string();
                }
                if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                    entry.2.push_str(args);
                }
            }
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .filter_map(|(id, name, arguments)| {
                if id.is_empty() || name.is_empty() {
                    return None;
                }
                let arguments: Value =
                    serde_json::from_str(&arguments).unwrap_or_else(|_| json!({}));
                Some(ToolCall {
                    id,
                    function_name: name,
                    arguments,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for OpenAiCompatProvider {
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
                .request(reqwest::Method::POST, "/embeddings")
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
                    last_err = Some(Error::embedding(PROVIDER_NAME, e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::embedding(PROVIDER_NAME, "embedding failed after retries")))
    }

    async fn health(&self) -> Result<()> {
        let resp = self
            .request(reqwest::Method::GET, "/models")
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("provider unreachable: {e}")))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Unavailable(format!(
                "health probe returned {}",
                resp.status()
            )))
        }
    }
}

fn parse_embed_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::embedding(PROVIDER_NAME, "missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::embedding(PROVIDER_NAME, "missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

#[async_trait]
impl Generator for OpenAiCompatProvider {
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

        let resp = self
            .request(reqwest::Method::POST, "/chat/completions")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::generation(PROVIDER_NAME, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(Error::generation(
                PROVIDER_NAME,
                format!("API error {status}: {body_text}"),
            ));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| Error::generation(PROVIDER_NAME, e.to_string()))?;

        let message = json
            .pointer("/choices/0/message")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tool_calls = parse_tool_calls(&message);

        debug!(tool_count = tool_calls.len(), "chat completion turn done");

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
            .request(reqwest::Method::POST, "/chat/completions")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::generation(PROVIDER_NAME, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(Error::generation(
                PROVIDER_NAME,
                format!("API error {status}: {body_text}"),
            ));
        }

        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        let mut content = String::new();
        let mut accumulator = ToolCallAccumulator::default();

        while let Some(item) = stream.next().await {
            let bytes = item.map_err(|e| Error::generation(PROVIDER_NAME, e.to_string()))?;
            buf.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buf.find('\n') {
                let line: String = buf.drain(..=pos).collect();
                let Some(chunk) = parse_sse_line(line.trim()) else {
                    continue;
                };
                let Some(delta) = chunk.pointer("/choices/0/delta") else {
                    continue;
                };
                if let Some(text) = delta.get("content").and_then(Value::as_str) {
                    if !text.is_empty() {
                        content.push_str(text);
                        sink(text);
                    }
                }
                if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                    accumulator.feed(calls);
                }
            }
        }

        let tool_calls = accumulator.finish();
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
        let json = json!({"data": [
            {"embedding": [0.1, 0.2]},
            {"embedding": [0.3, 0.4]},
        ]});
        let vectors = parse_embed_response(&json).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!((vectors[1][0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_parse_tool_calls_decodes_argument_strings() {
        let message = json!({
            "tool_calls": [{
                "id": "call_abc",
                "type": "function",
                "function": {"name": "echo", "arguments": "{\"text\": \"hi\"}"}
            }]
        });
        let calls = parse_tool_calls(&message);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_abc");
        assert_eq!(calls[0].arguments, json!({"text": "hi"}));
    }

    #[test]
    fn test_parse_sse_line() {
        assert!(parse_sse_line(": keepalive").is_none());
        assert!(parse_sse_line("data: [DONE]").is_none());
        let value = parse_sse_line(r#"data: {"choices": []}"#).unwrap();
        assert_eq!(value, json!({"choices": []}));
    }

    #[test]
    fn test_tool_call_accumulator() {
        let mut acc = ToolCallAccumulator::default();
        acc.feed(&[json!({
            "index": 0,
            "id": "call_1",
            "function": {"name": "echo", "arguments": "{\"te"}
        })]);
        acc.feed(&[json!({
            "index": 0,
            "function": {"arguments": "xt\": \"hi\"}"}
        })]);
        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function_name, "echo");
        assert_eq!(calls[0].arguments, json!({"text": "hi"}));
    }

    #[test]
    fn test_accumulator_drops_incomplete_calls() {
        let mut acc = ToolCallAccumulator::default();
        acc.feed(&[json!({"index": 0, "function": {"arguments": "{}"}})]);
        assert!(acc.finish().is_empty());
    }

    #[test]
    fn test_tool_choice_wire() {
        assert_eq!(tool_choice_to_wire(&ToolChoice::Auto), json!("auto"));
        assert_eq!(tool_choice_to_wire(&ToolChoice::Required), json!("required"));
        let named = tool_choice_to_wire(&ToolChoice::Function("echo".into()));
        assert_eq!(named["function"]["name"], "echo");
    }

    #[test]
    fn test_message_wire_tool_role() {
        let msg = Message::tool("call_9", "result");
        let wire = message_to_wire(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_9");
    }
}
