//! Ingestion pipeline orchestration.
//!
//! Coordinates the full flow: source materialization → optional LLM
//! metadata extraction → chunking → batched embedding → atomic storage.
//! Re-ingesting the same source produces the same deterministic document
//! id and replaces the prior chunks in one transaction.

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::chunker::{self, ChunkMethod, ChunkOptions};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{Chunk, Document, ExtractedMetadata, IngestRequest, IngestResponse, Metadata};
use crate::provider::{Embedder, Generator};
use crate::store::VectorStore;

/// Run a full ingest.
///
/// `generator` is only consulted when metadata extraction is enabled in
/// config; extraction failures degrade to empty metadata and a warning,
/// never a failed ingest.
pub async fn run_ingest(
    store: &VectorStore,
    embedder: &dyn Embedder,
    generator: Option<&dyn Generator>,
    config: &Config,
    request: &IngestRequest,
    cancel: &CancellationToken,
) -> Result<IngestResponse> {
    let source = Source::from_request(request)?;
    let text = source.materialize().await?;
    if text.trim().is_empty() {
        return Err(Error::invalid_arg("source produced no text"));
    }

    if cancel.is_cancelled() {
        return Err(Error::Canceled);
    }

    // Optional LLM metadata extraction, recovered locally on failure.
    let mut doc_metadata = request.metadata.clone();
    if config.ingest.extract_metadata {
        if let Some(generator) = generator {
            let extracted = extract_or_default(generator, &text).await;
            for (key, value) in extracted.into_metadata() {
                // Request-supplied metadata wins over extracted keys.
                doc_metadata.entry(key).or_insert(value);
            }
        }
    }

    let opts = ChunkOptions {
        size: request.chunk_size.unwrap_or(config.chunking.size),
        overlap: request.overlap.unwrap_or(config.chunking.overlap),
        method: match &request.method {
            Some(method) => method.parse::<ChunkMethod>()?,
            None => config.chunking.method.parse::<ChunkMethod>()?,
        },
    };
    let pieces = chunker::split(&text, &opts)?;

    let document_id = request
        .document_id
        .clone()
        .unwrap_or_else(|| source.derive_id());
    let created = chrono::Utc::now().timestamp();

    let document = Document {
        id: document_id.clone(),
        path: request.file_path.clone(),
        url: request.url.clone(),
        content: text,
        metadata: doc_metadata.clone(),
        created,
    };

    // Embed in batches; each batch is independent so a request stays
    // within provider limits.
    let batch_size = config.ingest.batch_size.max(1);
    let mut chunks: Vec<Chunk> = Vec::with_capacity(pieces.len());
    for batch in pieces.chunks(batch_size) {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        let vectors = embedder.embed_batch(batch).await?;
        if vectors.len() != batch.len() {
            return Err(Error::embedding(
                embedder.name(),
                format!(
                    "embedding count mismatch: {} texts, {} vectors",
                    batch.len(),
                    vectors.len()
                ),
            ));
        }

        for (content, vector) in batch.iter().zip(vectors) {
            let mut chunk_meta = Metadata::new();
            chunk_meta.insert("chunk_index".into(), serde_json::json!(chunks.len()));
            let metadata = merge_metadata(&doc_metadata, &chunk_meta);

            chunks.push(Chunk {
                id: Uuid::new_v4().to_string(),
                document_id: document_id.clone(),
                content: content.clone(),
                vector,
                metadata,
                score: None,
                created,
            });
        }
    }

    store.replace_document(&document, &chunks).await?;

    debug!(
        document_id = %document_id,
        chunk_count = chunks.len(),
        "ingest complete"
    );

    Ok(IngestResponse {
        document_id,
        chunk_count: chunks.len(),
    })
}

/// Extract metadata, falling back to the empty default on any failure.
pub async fn extract_or_default(generator: &dyn Generator, text: &str) -> ExtractedMetadata {
    match generator.extract_metadata(text).await {
        Ok(extracted) => extracted,
        Err(e) => {
            warn!("metadata extraction failed, continuing without: {e}");
            ExtractedMetadata::default()
        }
    }
}

/// Merge document- and chunk-level metadata; chunk keys win on collision.
pub fn merge_metadata(document: &Metadata, chunk: &Metadata) -> Metadata {
    let mut merged = document.clone();
    for (key, value) in chunk {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

// ============ Source materialization ============

enum Source {
    Inline(String),
    File(String),
    Url(String),
}

impl Source {
    fn from_request(request: &IngestRequest) -> Result<Self> {
        let provided = [
            request.content.is_some(),
            request.file_path.is_some(),
            request.url.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if provided != 1 {
            return Err(Error::invalid_arg(
                "exactly one of content, file_path, or url must be set",
            ));
        }

        if let Some(ref content) = request.content {
            Ok(Self::Inline(content.clone()))
        } else if let Some(ref path) = request.file_path {
            Ok(Self::File(path.clone()))
        } else if let Some(ref url) = request.url {
            Ok(Self::Url(url.clone()))
        } else {
            unreachable!("source counted above")
        }
    }

    async fn materialize(&self) -> Result<String> {
        match self {
            Self::Inline(content) => Ok(content.clone()),
            Self::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::invalid_arg(format!("cannot read file '{path}': {e}"))
            }),
            Self::Url(url) => {
                let resp = reqwest::get(url)
                    .await
                    .map_err(|e| Error::invalid_arg(format!("cannot fetch '{url}': {e}")))?;
                if !resp.status().is_success() {
                    return Err(Error::invalid_arg(format!(
                        "fetching '{url}' returned {}",
                        resp.status()
                    )));
                }
                resp.text()
                    .await
                    .map_err(|e| Error::invalid_arg(format!("cannot read body of '{url}': {e}")))
            }
        }
    }

    /// Deterministic document id derived from the source identity, so
    /// re-ingesting the same source replaces the prior document.
    fn derive_id(&self) -> String {
        let identity = match self {
            Self::Inline(content) => format!("inline:{content}"),
            Self::File(path) => format!("file:{path}"),
            Self::Url(url) => format!("url:{url}"),
        };
        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exactly_one_source_required() {
        let none = IngestRequest::default();
        assert!(Source::from_request(&none).is_err());

        let both = IngestRequest {
            content: Some("x".into()),
            file_path: Some("y".into()),
            ..Default::default()
        };
        assert!(Source::from_request(&both).is_err());

        let one = IngestRequest {
            content: Some("x".into()),
            ..Default::default()
        };
        assert!(Source::from_request(&one).is_ok());
    }

    #[test]
    fn test_derived_ids_are_deterministic() {
        let a = Source::File("/data/doc.md".into()).derive_id();
        let b = Source::File("/data/doc.md".into()).derive_id();
        let c = Source::File("/data/other.md".into()).derive_id();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_inline_and_file_ids_differ() {
        let inline = Source::Inline("same".into()).derive_id();
        let file = Source::File("same".into()).derive_id();
        assert_ne!(inline, file);
    }

    #[test]
    fn test_merge_metadata_chunk_wins() {
        let mut doc = Metadata::new();
        doc.insert("topic".into(), json!("general"));
        doc.insert("author".into(), json!("ann"));

        let mut chunk = Metadata::new();
        chunk.insert("topic".into(), json!("specific"));

        let merged = merge_metadata(&doc, &chunk);
        assert_eq!(merged.get("topic"), Some(&json!("specific")));
        assert_eq!(merged.get("author"), Some(&json!("ann")));
    }
}
