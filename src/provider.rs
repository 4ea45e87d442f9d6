//! Embedding and generation provider abstraction.
//!
//! Defines the [`Embedder`] and [`Generator`] traits that every backend
//! implements, plus the option/result types shared across them. Concrete
//! backends live in [`crate::providers`]; [`create_embedder`] and
//! [`create_generator`] pick one from configuration.
//!
//! Structured output and metadata extraction are provided as default trait
//! methods layered on `generate`, so a backend only has to implement the
//! four primitive operations (generate, stream, and their tool-aware twins).

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::models::{ExtractedMetadata, ToolCall, ToolDefinition};

/// Callback receiving streamed output chunks in arrival order.
pub type StreamSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// How the model may use tools for a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolChoice {
    /// The model decides whether to call tools.
    #[default]
    Auto,
    /// The model must call at least one tool.
    Required,
    /// Tools are disabled for this turn.
    None,
    /// The model must call this specific function.
    Function(String),
}

/// Options recognized by every generator backend.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Opt-in to reasoning traces in the output. Defaults to false so
    /// thinking is suppressed unless explicitly requested.
    pub think: bool,
    pub tool_choice: ToolChoice,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            think: false,
            tool_choice: ToolChoice::Auto,
        }
    }
}

/// One provider turn: text content and any requested tool calls.
#[derive(Debug, Clone, Default)]
pub struct GenerationResult {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// False while the model is still asking for tool results.
    pub finished: bool,
}

/// Result of a structured (JSON-schema constrained) generation.
#[derive(Debug, Clone)]
pub struct StructuredResult {
    /// Parsed JSON data (`Value::Null` when parsing failed).
    pub data: Value,
    /// Raw model output before parsing.
    pub raw: String,
    /// True when the output parsed and carried every required key.
    pub valid: bool,
}

/// Component producing a fixed-dimension vector from text.
///
/// The dimension is declared at construction and never changes for the
/// lifetime of the embedder.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Provider identifier used in error reports (e.g. `"ollama"`).
    fn name(&self) -> &str;

    /// Embedding dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::embedding(self.name(), "empty embedding response"))
    }

    /// Probe the backend for liveness.
    async fn health(&self) -> Result<()>;
}

/// Component producing text (and optional tool calls) from a prompt or
/// message list.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Provider identifier used in error reports.
    fn name(&self) -> &str;

    /// Plain one-shot generation.
    async fn generate(&self, prompt: &str, opts: &GenerationOptions) -> Result<String>;

    /// Streaming generation. Chunks are pushed to `sink` in arrival order;
    /// the stream is complete when this returns. Cancelling the calling
    /// context stops production; partial output already emitted stays with
    /// the caller.
    async fn stream(
        &self,
        prompt: &str,
        opts: &GenerationOptions,
        sink: StreamSink<'_>,
    ) -> Result<()>;

    /// One tool-aware turn over a message list.
    async fn generate_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &GenerationOptions,
    ) -> Result<GenerationResult>;

    /// Streaming twin of [`generate_with_tools`](Generator::generate_with_tools).
    /// Text deltas go to `sink`; the returned result carries the full
    /// content plus any tool calls collected from the stream.
    async fn stream_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &GenerationOptions,
        sink: StreamSink<'_>,
    ) -> Result<GenerationResult>;

    /// Generate JSON constrained by a schema. The default implementation
    /// appends a JSON-only instruction, parses the reply, and checks the
    /// schema's `required` keys.
    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Value,
        opts: &GenerationOptions,
    ) -> Result<StructuredResult> {
        let full_prompt = format!(
            "{prompt}\n\nRespond with a single JSON object matching this schema, \
             and nothing else:\n{schema}"
        );
        let raw = self.generate(&full_prompt, opts).await?;
        let cleaned = strip_code_fences(&raw);

        match serde_json::from_str::<Value>(cleaned) {
            Ok(data) => {
                let valid = required_keys_present(&data, schema);
                Ok(StructuredResult { data, raw, valid })
            }
            Err(_) => Ok(StructuredResult {
                data: Value::Null,
                raw,
                valid: false,
            }),
        }
    }

    /// Extract document metadata with a fixed JSON-only contract.
    ///
    /// Parse failures surface as [`Error::Generation`]; callers that treat
    /// extraction as optional recover to `ExtractedMetadata::default()`.
    async fn extract_metadata(&self, content: &str) -> Result<ExtractedMetadata> {
        let opts = GenerationOptions {
            temperature: 0.1,
            ..GenerationOptions::default()
        };
        let prompt = metadata_extraction_prompt(content);
        let raw = self.generate(&prompt, &opts).await?;
        let cleaned = strip_code_fences(&raw);

        serde_json::from_str::<ExtractedMetadata>(cleaned).map_err(|e| {
            debug!(provider = self.name(), "metadata extraction did not parse");
            Error::generation(self.name(), format!("metadata extraction parse: {e}"))
        })
    }

    /// Probe the backend for liveness.
    async fn health(&self) -> Result<()>;
}

/// The fixed extraction prompt shared by every backend.
fn metadata_extraction_prompt(content: &str) -> String {
    format!(
        "Analyze the following document and extract structured metadata. \
         Respond with a single JSON object with these keys: \
         \"summary\" (string, 1-2 sentences), \
         \"keywords\" (array of strings), \
         \"document_type\" (string), \
         \"creation_date\" (string, YYYY-MM-DD or empty), \
         \"collection\" (string), \
         \"temporal_refs\" (object mapping phrases to dates), \
         \"entities\" (object mapping entity types to arrays of names), \
         \"events\" (array of strings). \
         Output only the JSON object.\n\nDocument:\n{content}"
    )
}

/// Remove a surrounding markdown code fence, if present.
pub(crate) fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the fence line.
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    rest.strip_suffix("```").map_or(rest, str::trim).trim()
}

/// Check that every key in the schema's `required` array exists in the data.
fn required_keys_present(data: &Value, schema: &Value) -> bool {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return data.is_object();
    };
    let Some(obj) = data.as_object() else {
        return false;
    };
    required
        .iter()
        .filter_map(Value::as_str)
        .all(|key| obj.contains_key(key))
}

/// Instantiate the configured embedder backend.
pub fn create_embedder(config: &Config) -> Result<Box<dyn Embedder>> {
    match config.providers.default_embedder.as_str() {
        "ollama" => Ok(Box::new(crate::providers::ollama::OllamaProvider::new(
            &config.providers.ollama,
        )?)),
        "openai" | "lmstudio" => Ok(Box::new(
            crate::providers::openai_compat::OpenAiCompatProvider::new(&config.providers.openai)?,
        )),
        "disabled" => Err(Error::Unavailable("embedding provider is disabled".into())),
        other => Err(Error::invalid_arg(format!(
            "unknown embedding provider: '{other}'"
        ))),
    }
}

/// Instantiate the configured generator backend.
pub fn create_generator(config: &Config) -> Result<Box<dyn Generator>> {
    match config.providers.default_llm.as_str() {
        "ollama" => Ok(Box::new(crate::providers::ollama::OllamaProvider::new(
            &config.providers.ollama,
        )?)),
        "openai" | "lmstudio" => Ok(Box::new(
            crate::providers::openai_compat::OpenAiCompatProvider::new(&config.providers.openai)?,
        )),
        "disabled" => Err(Error::Unavailable(
            "generation provider is disabled".into(),
        )),
        other => Err(Error::invalid_arg(format!(
            "unknown generation provider: '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\": 1}"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("  {\"a\": 1}  "), "{\"a\": 1}");
    }

    #[test]
    fn test_required_keys_present() {
        let schema = json!({"type": "object", "required": ["name", "age"]});
        assert!(required_keys_present(
            &json!({"name": "x", "age": 3, "extra": true}),
            &schema
        ));
        assert!(!required_keys_present(&json!({"name": "x"}), &schema));
        assert!(!required_keys_present(&json!("not an object"), &schema));

        // No required list: any object passes.
        let loose = json!({"type": "object"});
        assert!(required_keys_present(&json!({}), &loose));
    }

    #[test]
    fn test_tool_choice_default_is_auto() {
        assert_eq!(ToolChoice::default(), ToolChoice::Auto);
        assert!(!GenerationOptions::default().think);
    }
}
