//! Core data models used throughout the platform.
//!
//! These types represent the documents, chunks, queries, and tool calls that
//! flow through the ingestion, retrieval, and generation pipeline.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Arbitrary key/value metadata attached to documents and chunks.
pub type Metadata = HashMap<String, Value>;

/// A document stored in the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable document identifier.
    pub id: String,
    /// Originating file path, if ingested from a file.
    pub path: Option<String>,
    /// Originating URL, if ingested from the network.
    pub url: Option<String>,
    /// Full document text.
    pub content: String,
    /// Document-level metadata.
    pub metadata: Metadata,
    /// Creation timestamp (Unix seconds).
    pub created: i64,
}

/// A chunk of a document with its embedding vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Chunk identifier.
    pub id: String,
    /// Parent document identifier.
    pub document_id: String,
    /// Chunk text.
    pub content: String,
    /// Embedding vector. Its length must equal the store dimension.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub vector: Vec<f32>,
    /// Merged document + chunk metadata.
    pub metadata: Metadata,
    /// Similarity score assigned during retrieval.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub score: Option<f64>,
    /// Creation timestamp (Unix seconds).
    pub created: i64,
}

/// Structured metadata produced by an LLM over raw document content.
///
/// Every field is optional at the wire level; a failed extraction degrades
/// to `ExtractedMetadata::default()` rather than failing the ingest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedMetadata {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub document_type: String,
    #[serde(default)]
    pub creation_date: String,
    #[serde(default)]
    pub collection: String,
    #[serde(default)]
    pub temporal_refs: HashMap<String, String>,
    #[serde(default)]
    pub entities: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub events: Vec<String>,
}

impl ExtractedMetadata {
    /// Flatten into document metadata keys. Empty fields are skipped so a
    /// default extraction contributes nothing.
    pub fn into_metadata(self) -> Metadata {
        let mut meta = Metadata::new();
        if !self.summary.is_empty() {
            meta.insert("summary".into(), Value::String(self.summary));
        }
        if !self.keywords.is_empty() {
            meta.insert(
                "keywords".into(),
                Value::Array(self.keywords.into_iter().map(Value::String).collect()),
            );
        }
        if !self.document_type.is_empty() {
            meta.insert("document_type".into(), Value::String(self.document_type));
        }
        if !self.creation_date.is_empty() {
            meta.insert("creation_date".into(), Value::String(self.creation_date));
        }
        if !self.collection.is_empty() {
            meta.insert("collection".into(), Value::String(self.collection));
        }
        if !self.temporal_refs.is_empty() {
            meta.insert(
                "temporal_refs".into(),
                serde_json::to_value(self.temporal_refs).unwrap_or(Value::Null),
            );
        }
        if !self.entities.is_empty() {
            meta.insert(
                "entities".into(),
                serde_json::to_value(self.entities).unwrap_or(Value::Null),
            );
        }
        if !self.events.is_empty() {
            meta.insert(
                "events".into(),
                Value::Array(self.events.into_iter().map(Value::String).collect()),
            );
        }
        meta
    }
}

/// A retrieval-augmented query request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// The user's question.
    pub query: String,
    /// Number of chunks to retrieve. Zero disables retrieval.
    pub top_k: usize,
    /// Sampling temperature, validated to `[0.0, 2.0]`.
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Stream the answer through a callback instead of returning it whole.
    pub stream: bool,
    /// Include retrieved chunks in the response.
    pub show_sources: bool,
    /// Keep the model's reasoning trace in the output.
    pub show_thinking: bool,
    /// Metadata equality filters applied during retrieval.
    #[serde(default)]
    pub filters: Metadata,
    /// Expose tools to the model for this query.
    pub tools_enabled: bool,
    /// Tools the model may call. Empty means none are allowed.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Upper bound on executed tool calls for the query.
    pub max_tool_calls: usize,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            top_k: 5,
            temperature: 0.7,
            max_tokens: 2048,
            stream: false,
            show_sources: false,
            show_thinking: false,
            filters: Metadata::new(),
            tools_enabled: false,
            allowed_tools: Vec::new(),
            max_tool_calls: 5,
        }
    }
}

impl QueryRequest {
    /// Validate the request bounds.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.query.trim().is_empty() {
            return Err(crate::error::Error::invalid_arg("query must not be empty"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(crate::error::Error::invalid_arg(
                "temperature must be in [0.0, 2.0]",
            ));
        }
        if self.max_tokens == 0 {
            return Err(crate::error::Error::invalid_arg("max_tokens must be > 0"));
        }
        Ok(())
    }
}

/// The answer to a [`QueryRequest`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResponse {
    /// Generated answer text.
    pub answer: String,
    /// Retrieved chunks, present when `show_sources` was set.
    pub sources: Vec<Chunk>,
    /// Wall-clock time for the whole query in milliseconds.
    pub elapsed_ms: u64,
    /// Tool calls executed during the query, in execution order.
    pub tool_calls: Vec<ExecutedToolCall>,
    /// Distinct tool names used, in first-use order.
    pub tools_used: Vec<String>,
}

/// An ingestion request. Exactly one of `content`, `file_path`, `url` must
/// be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestRequest {
    /// Inline text to ingest.
    pub content: Option<String>,
    /// Local file to read.
    pub file_path: Option<String>,
    /// URL to fetch.
    pub url: Option<String>,
    /// Explicit document id; derived from the source when absent.
    pub document_id: Option<String>,
    /// Chunk size override.
    pub chunk_size: Option<usize>,
    /// Chunk overlap override.
    pub overlap: Option<usize>,
    /// Chunking method override: `sentence`, `paragraph`, or `token`.
    pub method: Option<String>,
    /// Document-level metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Outcome of an ingest.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub document_id: String,
    pub chunk_count: usize,
}

/// A tool exposed to the model, with a JSON-Schema parameter description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema object: `{"type": "object", "properties": {...}, ...}`.
    pub parameters: Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back in the tool message.
    pub id: String,
    /// Tool name, namespaced `<server>_<tool>` for MCP tools.
    pub function_name: String,
    /// Call arguments as a JSON object.
    pub arguments: Value,
}

/// A [`ToolCall`] together with its execution outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutedToolCall {
    pub id: String,
    pub function_name: String,
    pub arguments: Value,
    /// Result payload, present on success.
    pub result: Option<Value>,
    pub success: bool,
    pub error: Option<String>,
    /// Execution time in milliseconds.
    pub elapsed_ms: u64,
}

/// The outcome of a single tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Render for the model: the data on success, `Error: <message>` otherwise.
    pub fn render(&self) -> String {
        if self.success {
            self.data
                .as_ref()
                .map(|d| match d {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        } else {
            format!(
                "Error: {}",
                self.error.as_deref().unwrap_or("unknown tool failure")
            )
        }
    }
}
