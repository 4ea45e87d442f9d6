//! Retrieval and prompt composition.
//!
//! `retrieve` embeds the query and delegates to the store's filtered
//! top-k search. `compose` assembles the deterministic augmented prompt:
//! a system preface, a numbered enumeration of chunk contents, then the
//! user's question. Composition never modifies chunk contents.

use crate::error::Result;
use crate::models::{Chunk, Metadata};
use crate::provider::Embedder;
use crate::store::VectorStore;

/// Embed the query and fetch the top-k matching chunks.
///
/// `top_k == 0` short-circuits to an empty result without calling the
/// embedder at all.
pub async fn retrieve(
    embedder: &dyn Embedder,
    store: &VectorStore,
    query: &str,
    top_k: usize,
    filters: &Metadata,
) -> Result<Vec<Chunk>> {
    if top_k == 0 {
        return Ok(Vec::new());
    }

    let vector = embedder.embed(query).await?;
    store.search_with_filters(&vector, top_k, filters).await
}

/// Build the augmented prompt from retrieved context.
///
/// With no chunks, the prompt asks the model to answer from general
/// knowledge; otherwise the context is enumerated with optional scores.
pub fn compose(query: &str, chunks: &[Chunk], show_scores: bool) -> String {
    if chunks.is_empty() {
        return format!(
            "Answer the following question based on your general knowledge.\n\n\
             Question: {query}"
        );
    }

    let mut prompt = String::from(
        "Answer the question using the context below. \
         If the context does not contain the answer, say so.\n\nContext:\n",
    );

    for (i, chunk) in chunks.iter().enumerate() {
        if show_scores {
            let score = chunk.score.unwrap_or(0.0);
            prompt.push_str(&format!("{}. [{:.3}] {}\n", i + 1, score, chunk.content));
        } else {
            prompt.push_str(&format!("{}. {}\n", i + 1, chunk.content));
        }
    }

    prompt.push_str(&format!("\nQuestion: {query}"));
    prompt
}
