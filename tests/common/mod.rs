//! Shared test doubles: a deterministic bag-of-words embedder and a
//! scripted generator, plus a client builder over an in-memory store.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use ragkit::client::RagClient;
use ragkit::config::Config;
use ragkit::error::Result;
use ragkit::message::Message;
use ragkit::models::{ToolCall, ToolDefinition};
use ragkit::provider::{
    Embedder, GenerationOptions, GenerationResult, Generator, StreamSink,
};
use ragkit::store::VectorStore;

/// Deterministic embedder: a normalized bag-of-words histogram. Texts that
/// share words land close in cosine space, which is enough to make
/// retrieval ranking meaningful in tests.
pub struct HashEmbedder {
    pub dims: usize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self { dims: 32 }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let lower = word.to_lowercase();
            let slot = lower
                .bytes()
                .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize))
                % self.dims;
            vector[slot] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

/// A "correct" generator for RAG tests: it answers with the context it was
/// given, so any fact present in the retrieved chunks appears in the
/// answer.
pub struct ContextEchoGenerator;

#[async_trait]
impl Generator for ContextEchoGenerator {
    fn name(&self) -> &str {
        "context-echo"
    }

    async fn generate(&self, prompt: &str, _opts: &GenerationOptions) -> Result<String> {
        Ok(format!("Based on the context: {prompt}"))
    }

    async fn stream(
        &self,
        prompt: &str,
        opts: &GenerationOptions,
        sink: StreamSink<'_>,
    ) -> Result<()> {
        let answer = self.generate(prompt, opts).await?;
        // Emit in two chunks to exercise accumulation.
        let mid = answer.len() / 2;
        let split = answer
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| i >= mid)
            .unwrap_or(answer.len());
        sink(&answer[..split]);
        sink(&answer[split..]);
        Ok(())
    }

    async fn generate_with_tools(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
        opts: &GenerationOptions,
    ) -> Result<GenerationResult> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, ragkit::message::Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let content = self.generate(last_user, opts).await?;
        Ok(GenerationResult {
            content,
            tool_calls: Vec::new(),
            finished: true,
        })
    }

    async fn stream_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &GenerationOptions,
        sink: StreamSink<'_>,
    ) -> Result<GenerationResult> {
        let result = self.generate_with_tools(messages, tools, opts).await?;
        sink(&result.content);
        Ok(result)
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

/// Generator that requests an `echo` tool call every turn, forever.
pub struct EchoToolGenerator {
    pub turns: AtomicUsize,
}

impl EchoToolGenerator {
    pub fn new() -> Self {
        Self {
            turns: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Generator for EchoToolGenerator {
    fn name(&self) -> &str {
        "echo-tool"
    }

    async fn generate(&self, _prompt: &str, _opts: &GenerationOptions) -> Result<String> {
        Ok("no tools".to_string())
    }

    async fn stream(
        &self,
        _prompt: &str,
        _opts: &GenerationOptions,
        sink: StreamSink<'_>,
    ) -> Result<()> {
        sink("no tools");
        Ok(())
    }

    async fn generate_with_tools(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
        _opts: &GenerationOptions,
    ) -> Result<GenerationResult> {
        let turn = self.turns.fetch_add(1, Ordering::SeqCst);
        Ok(GenerationResult {
            content: "calling echo".to_string(),
            tool_calls: vec![ToolCall {
                id: format!("call_{turn}"),
                function_name: "echo".to_string(),
                arguments: json!({"text": "hi"}),
            }],
            finished: false,
        })
    }

    async fn stream_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &GenerationOptions,
        sink: StreamSink<'_>,
    ) -> Result<GenerationResult> {
        let result = self.generate_with_tools(messages, tools, opts).await?;
        sink(&result.content);
        Ok(result)
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

/// Build a client over an in-memory store with the hash embedder and the
/// given generator.
pub async fn make_client(generator: Arc<dyn Generator>) -> RagClient {
    let store = Arc::new(VectorStore::open_in_memory().await.unwrap());
    RagClient::with_components(
        Config::default(),
        store,
        Arc::new(HashEmbedder::new()),
        generator,
    )
    .await
    .unwrap()
}
