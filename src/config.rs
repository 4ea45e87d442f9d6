//! Configuration parsing and validation.
//!
//! The platform is configured via a TOML file (default: `ragkit.toml`).
//! The config defines the store path, chunking parameters, provider
//! selection and connection settings, ingest behavior, MCP tool servers,
//! and the task scheduler.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::chunker::ChunkMethod;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub query: QueryDefaults,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/ragkit.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
    #[serde(default = "default_chunk_method")]
    pub method: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
            overlap: default_chunk_overlap(),
            method: default_chunk_method(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_chunk_method() -> String {
    "sentence".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvidersConfig {
    /// Generation backend: `ollama`, `openai`, `lmstudio`, or `disabled`.
    #[serde(default = "default_provider_ollama")]
    pub default_llm: String,
    /// Embedding backend: `ollama`, `openai`, `lmstudio`, or `disabled`.
    #[serde(default = "default_provider_ollama")]
    pub default_embedder: String,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default_llm: default_provider_ollama(),
            default_embedder: default_provider_ollama(),
            ollama: OllamaConfig::default(),
            openai: OpenAiConfig::default(),
        }
    }
}

fn default_provider_ollama() -> String {
    "ollama".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_ollama_llm")]
    pub llm_model: String,
    #[serde(default = "default_ollama_embedding")]
    pub embedding_model: String,
    #[serde(default = "default_ollama_dims")]
    pub embedding_dims: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            llm_model: default_ollama_llm(),
            embedding_model: default_ollama_embedding(),
            embedding_dims: default_ollama_dims(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_llm() -> String {
    "qwen3".to_string()
}
fn default_ollama_embedding() -> String {
    "nomic-embed-text".to_string()
}
fn default_ollama_dims() -> usize {
    768
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    /// Any OpenAI-compatible endpoint (OpenAI, LM Studio, vLLM, ...).
    #[serde(default = "default_openai_url")]
    pub base_url: String,
    /// Environment variable holding the API key. Empty disables auth,
    /// which local OpenAI-compatible servers accept.
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_openai_llm")]
    pub llm_model: String,
    #[serde(default = "default_openai_embedding")]
    pub embedding_model: String,
    #[serde(default = "default_openai_dims")]
    pub embedding_dims: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_url(),
            api_key_env: default_openai_key_env(),
            llm_model: default_openai_llm(),
            embedding_model: default_openai_embedding(),
            embedding_dims: default_openai_dims(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_openai_llm() -> String {
    "gpt-4o-mini".to_string()
}
fn default_openai_embedding() -> String {
    "text-embedding-3-small".to_string()
}
fn default_openai_dims() -> usize {
    1536
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Run LLM metadata extraction during ingest. Extraction failures
    /// never fail the ingest; they fall back to empty metadata.
    #[serde(default)]
    pub extract_metadata: bool,
    /// Texts per embedding request.
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            extract_metadata: false,
            batch_size: default_embed_batch_size(),
        }
    }
}

fn default_embed_batch_size() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryDefaults {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_tool_calls: default_max_tool_calls(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_max_tool_calls() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct McpConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Tool servers keyed by name. Tools are exposed as `<server>_<tool>`.
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,
    /// Concurrency cap for batch tool calls.
    #[serde(default = "default_mcp_concurrency")]
    pub max_concurrent_calls: usize,
    /// Per-call timeout in seconds.
    #[serde(default = "default_tool_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Consecutive health-probe failures before a server is marked failed.
    #[serde(default = "default_health_threshold")]
    pub health_failure_threshold: u32,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            servers: HashMap::new(),
            max_concurrent_calls: default_mcp_concurrency(),
            call_timeout_secs: default_tool_timeout_secs(),
            health_failure_threshold: default_health_threshold(),
        }
    }
}

fn default_mcp_concurrency() -> usize {
    4
}
fn default_tool_timeout_secs() -> u64 {
    30
}
fn default_health_threshold() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct McpServerConfig {
    /// Executable to spawn.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Concurrent execution cap; saturated ticks skip due tasks.
    #[serde(default = "default_sched_concurrency")]
    pub max_concurrent: usize,
    /// Days to keep task execution records.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Executions kept per task beyond the retention window.
    #[serde(default = "default_exec_history")]
    pub max_history: i64,
    /// Tick interval for due-task evaluation, in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Safelist of command heads the `script` task type may run.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent: default_sched_concurrency(),
            retention_days: default_retention_days(),
            max_history: default_exec_history(),
            tick_secs: default_tick_secs(),
            allowed_commands: Vec::new(),
        }
    }
}

fn default_sched_concurrency() -> usize {
    5
}
fn default_retention_days() -> i64 {
    30
}
fn default_exec_history() -> i64 {
    100
}
fn default_tick_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.size == 0 {
        anyhow::bail!("chunking.size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.size {
        anyhow::bail!("chunking.overlap must be smaller than chunking.size");
    }
    config
        .chunking
        .method
        .parse::<ChunkMethod>()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    if !(0.0..=2.0).contains(&config.query.temperature) {
        anyhow::bail!("query.temperature must be in [0.0, 2.0]");
    }
    if config.query.max_tokens == 0 {
        anyhow::bail!("query.max_tokens must be > 0");
    }

    match config.providers.default_embedder.as_str() {
        "ollama" => {
            if config.providers.ollama.embedding_dims == 0 {
                anyhow::bail!("providers.ollama.embedding_dims must be > 0");
            }
        }
        "openai" | "lmstudio" => {
            if config.providers.openai.embedding_dims == 0 {
                anyhow::bail!("providers.openai.embedding_dims must be > 0");
            }
        }
        "disabled" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be ollama, openai, lmstudio, or disabled.",
            other
        ),
    }

    if config.scheduler.max_concurrent == 0 {
        anyhow::bail!("scheduler.max_concurrent must be >= 1");
    }
    if config.scheduler.retention_days < 1 {
        anyhow::bail!("scheduler.retention_days must be >= 1");
    }
    if config.mcp.max_concurrent_calls == 0 {
        anyhow::bail!("mcp.max_concurrent_calls must be >= 1");
    }

    Ok(())
}
