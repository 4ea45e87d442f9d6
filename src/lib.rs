//! # ragkit
//!
//! **A local-first retrieval-augmented generation platform.**
//!
//! ragkit ingests heterogeneous documents, derives semantic embeddings,
//! persists them in a SQLite vector store, and answers natural-language
//! queries by retrieving top-k context and driving a pluggable language
//! model backend. Around that core it coordinates external tool servers
//! (MCP), a cron task scheduler, and a multi-turn conversation layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────┐
//! │   Sources    │──▶│   Pipeline    │──▶│  SQLite    │
//! │ file/url/text│   │ Chunk+Embed  │   │ docs+vecs │
//! └──────────────┘   └──────────────┘   └─────┬─────┘
//!                                             │
//!                     ┌───────────────────────┤
//!                     ▼                       ▼
//!               ┌───────────┐          ┌───────────┐
//!               │ Retrieval │──prompt─▶│ Generator │◀─┐
//!               └───────────┘          └─────┬─────┘  │ tool loop
//!                                            ▼        │
//!                                      ┌───────────┐  │
//!                                      │ MCP tools │──┘
//!                                      └───────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. **Ingest** ([`ingest`]): a file, URL, or inline text is chunked
//!    ([`chunker`]), embedded in batches ([`provider`]), and stored
//!    atomically with its document ([`store`]).
//! 2. **Query** ([`client`]): the question is embedded, top-k chunks are
//!    retrieved with metadata filters, a deterministic prompt is composed
//!    ([`retrieve`]), and the generator produces the answer — optionally
//!    looping through MCP tools ([`generation`], [`mcp`]).
//! 3. **Schedule** ([`scheduler`]): cron-driven tasks reuse the same
//!    executors for queries, ingests, vetted scripts, and tool calls.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Closed error taxonomy shared by every public operation |
//! | [`models`] | Core data types: `Document`, `Chunk`, `QueryRequest`, tool calls |
//! | [`message`] | Chat message model and bounded conversation history |
//! | [`chunker`] | Sentence / paragraph / token splitting with overlap |
//! | [`db`] | SQLite connection pool (WAL) |
//! | [`store`] | Vector + document store with cosine top-k and filters |
//! | [`provider`] | `Embedder` / `Generator` traits and provider factories |
//! | [`providers`] | Ollama and OpenAI-compatible HTTP backends |
//! | [`ingest`] | Source → chunks → embeddings → store pipeline |
//! | [`retrieve`] | Query embedding, filtered retrieval, prompt composition |
//! | [`mcp`] | Tool server lifecycle, discovery, namespaced invocation |
//! | [`generation`] | Plain, streaming, and bounded tool-loop generation |
//! | [`chat`] | Multi-turn conversation layer over retrieval and tools |
//! | [`client`] | `RagClient` facade composing everything above |
//! | [`cron`] | Pure cron parsing and next-run computation |
//! | [`scheduler`] | Task store, ticker, executor plug-ins, sweeper |
//! | [`executors`] | Built-in query / ingest / script / tool executors |

pub mod chat;
pub mod chunker;
pub mod client;
pub mod config;
pub mod cron;
pub mod db;
pub mod error;
pub mod executors;
pub mod generation;
pub mod ingest;
pub mod mcp;
pub mod message;
pub mod models;
pub mod provider;
pub mod providers;
pub mod retrieve;
pub mod scheduler;
pub mod store;

pub use client::RagClient;
pub use error::{Error, Result};
