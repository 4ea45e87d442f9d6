//! Vector and document store over SQLite.
//!
//! Documents and their chunks live in two tables on the same pool; chunk
//! embeddings are stored as little-endian `f32` BLOBs. Search is a
//! brute-force cosine scan over all stored vectors, optionally restricted
//! by metadata equality filters. Writes are serialized through transactions
//! (single-writer, multi-reader); a cascade delete is all-or-nothing.
//!
//! The store records its embedding dimension on first write and rejects
//! mismatching vectors afterwards. Changing embedding models requires a
//! [`VectorStore::reset`].

use std::path::Path;

use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::db;
use crate::error::{Error, Result};
use crate::models::{Chunk, Document, Metadata};

/// SQLite-backed document + vector store.
pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    /// Open (or create) a store at the given path and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory store (used by tests and one-shot tooling).
    pub async fn open_in_memory() -> Result<Self> {
        let pool = db::connect_in_memory().await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// The underlying pool, shared with the task scheduler.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                path TEXT,
                url TEXT,
                content TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                created INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                content TEXT NOT NULL,
                vector BLOB NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                created INTEGER NOT NULL,
                FOREIGN KEY (document_id) REFERENCES documents(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_created ON documents(created DESC)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// The embedding dimension fixed by the first stored batch, if any.
    pub async fn dimension(&self) -> Result<Option<usize>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM store_meta WHERE key = 'dimension'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.and_then(|v| v.parse::<usize>().ok()))
    }

    /// Insert or replace a document row.
    pub async fn insert_document(&self, doc: &Document) -> Result<()> {
        let metadata_json = serde_json::to_string(&doc.metadata)
            .map_err(|e| Error::invalid_arg(format!("unserializable metadata: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, path, url, content, metadata_json, created)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                path = excluded.path,
                url = excluded.url,
                content = excluded.content,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.path)
        .bind(&doc.url)
        .bind(&doc.content)
        .bind(&metadata_json)
        .bind(doc.created)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Store a batch of chunks atomically.
    ///
    /// Every vector in the batch must match the store dimension; the first
    /// batch ever stored fixes it. A mismatch fails the whole batch.
    pub async fn store_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let expected = self.check_dimensions(chunks).await?;

        let mut tx = self.pool.begin().await?;

        for chunk in chunks {
            let metadata_json = serde_json::to_string(&chunk.metadata)
                .map_err(|e| Error::invalid_arg(format!("unserializable metadata: {e}")))?;

            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, content, vector, metadata_json, created)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    content = excluded.content,
                    vector = excluded.vector,
                    metadata_json = excluded.metadata_json
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.content)
            .bind(vec_to_blob(&chunk.vector))
            .bind(&metadata_json)
            .bind(chunk.created)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO store_meta (key, value) VALUES ('dimension', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(expected.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(count = chunks.len(), "stored chunk batch");
        Ok(())
    }

    /// Replace a document and all of its chunks in one transaction.
    ///
    /// This is the re-ingest path: the old chunks disappear and the new
    /// ones land atomically, so readers never observe a half-replaced
    /// document.
    pub async fn replace_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        let expected = if chunks.is_empty() {
            0
        } else {
            self.check_dimensions(chunks).await?
        };

        let metadata_json = serde_json::to_string(&doc.metadata)
            .map_err(|e| Error::invalid_arg(format!("unserializable metadata: {e}")))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, path, url, content, metadata_json, created)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                path = excluded.path,
                url = excluded.url,
                content = excluded.content,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.path)
        .bind(&doc.url)
        .bind(&doc.content)
        .bind(&metadata_json)
        .bind(doc.created)
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            let chunk_meta = serde_json::to_string(&chunk.metadata)
                .map_err(|e| Error::invalid_arg(format!("unserializable metadata: {e}")))?;

            sqlx::query(
                "INSERT INTO chunks (id, document_id, content, vector, metadata_json, created)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.content)
            .bind(vec_to_blob(&chunk.vector))
            .bind(&chunk_meta)
            .bind(chunk.created)
            .execute(&mut *tx)
            .await?;
        }

        if !chunks.is_empty() {
            sqlx::query(
                "INSERT INTO store_meta (key, value) VALUES ('dimension', ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(expected.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Validate a batch against the store dimension, returning the
    /// effective dimension for the write.
    async fn check_dimensions(&self, chunks: &[Chunk]) -> Result<usize> {
        let mut expected = self.dimension().await?;
        for chunk in chunks {
            if chunk.vector.is_empty() {
                return Err(Error::invalid_arg(format!(
                    "chunk '{}' has an empty vector",
                    chunk.id
                )));
            }
            match expected {
                Some(dim) if chunk.vector.len() != dim => {
                    return Err(Error::invalid_arg(format!(
                        "dimension mismatch: chunk '{}' has {} dims, store expects {}",
                        chunk.id,
                        chunk.vector.len(),
                        dim
                    )));
                }
                Some(_) => {}
                None => expected = Some(chunk.vector.len()),
            }
        }
        // Callers pass a non-empty batch, so expected is always set here.
        expected.ok_or_else(|| Error::invalid_arg("empty chunk batch"))
    }

    /// Top-k chunks by cosine similarity, highest score first.
    pub async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<Chunk>> {
        self.search_with_filters(vector, top_k, &Metadata::new())
            .await
    }

    /// Top-k cosine search restricted to chunks whose metadata matches
    /// every `(key, value)` equality predicate. An empty filter map is
    /// equivalent to no filter.
    pub async fn search_with_filters(
        &self,
        vector: &[f32],
        top_k: usize,
        filters: &Metadata,
    ) -> Result<Vec<Chunk>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT id, document_id, content, vector, metadata_json, created FROM chunks",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut candidates: Vec<Chunk> = Vec::with_capacity(rows.len());
        for row in &rows {
            let metadata_json: String = row.get("metadata_json");
            let metadata: Metadata = serde_json::from_str(&metadata_json).unwrap_or_default();

            if !matches_filters(&metadata, filters) {
                continue;
            }

            let blob: Vec<u8> = row.get("vector");
            let stored = blob_to_vec(&blob);
            let score = cosine_similarity(vector, &stored) as f64;

            candidates.push(Chunk {
                id: row.get("id"),
                document_id: row.get("document_id"),
                content: row.get("content"),
                vector: stored,
                metadata,
                score: Some(score),
                created: row.get("created"),
            });
        }

        // Sort: score desc, created desc, id asc.
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created.cmp(&a.created))
                .then(a.id.cmp(&b.id))
        });
        candidates.truncate(top_k);

        Ok(candidates)
    }

    /// All stored documents, newest first.
    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT id, path, url, content, metadata_json, created
             FROM documents ORDER BY created DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_document).collect())
    }

    /// Fetch a document by id.
    pub async fn get_document(&self, id: &str) -> Result<Document> {
        let row = sqlx::query(
            "SELECT id, path, url, content, metadata_json, created FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(row_to_document)
            .ok_or_else(|| Error::NotFound(format!("document '{id}'")))
    }

    /// Delete a document and all of its chunks, all-or-nothing.
    pub async fn delete_document(&self, id: &str) -> Result<()> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(Error::NotFound(format!("document '{id}'")));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(document_id = id, "deleted document and chunks");
        Ok(())
    }

    /// Drop all documents, chunks, and the recorded dimension.
    pub async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM documents")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM store_meta WHERE key = 'dimension'")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Document count (for status output).
    pub async fn document_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Chunk count (for status output).
    pub async fn chunk_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?)
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Document {
    let metadata_json: String = row.get("metadata_json");
    Document {
        id: row.get("id"),
        path: row.get("path"),
        url: row.get("url"),
        content: row.get("content"),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created: row.get("created"),
    }
}

/// True when every filter key is present in the metadata with an equal value.
fn matches_filters(metadata: &Metadata, filters: &Metadata) -> bool {
    filters
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_doc(id: &str) -> Document {
        Document {
            id: id.to_string(),
            path: None,
            url: None,
            content: format!("content of {id}"),
            metadata: Metadata::new(),
            created: 1_700_000_000,
        }
    }

    fn make_chunk(id: &str, doc_id: &str, vector: Vec<f32>, created: i64) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: doc_id.to_string(),
            content: format!("chunk {id}"),
            vector,
            metadata: Metadata::new(),
            score: None,
            created,
        }
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_basics() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_store_and_search_ordering() {
        let store = VectorStore::open_in_memory().await.unwrap();
        store.insert_document(&make_doc("d1")).await.unwrap();

        store
            .store_chunks(&[
                make_chunk("c1", "d1", vec![1.0, 0.0], 10),
                make_chunk("c2", "d1", vec![0.9, 0.1], 20),
                make_chunk("c3", "d1", vec![0.0, 1.0], 30),
            ])
            .await
            .unwrap();

        let results = store.search(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "c1");
        assert_eq!(results[1].id, "c2");
        assert!(results[0].score.unwrap() >= results[1].score.unwrap());
    }

    #[tokio::test]
    async fn test_search_tie_breaks_by_created_then_id() {
        let store = VectorStore::open_in_memory().await.unwrap();
        store.insert_document(&make_doc("d1")).await.unwrap();

        // Identical vectors => identical scores.
        store
            .store_chunks(&[
                make_chunk("b", "d1", vec![1.0, 0.0], 10),
                make_chunk("a", "d1", vec![1.0, 0.0], 10),
                make_chunk("c", "d1", vec![1.0, 0.0], 20),
            ])
            .await
            .unwrap();

        let results = store.search(&[1.0, 0.0], 3).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|c| c.id.as_str()).collect();
        // created desc first, then id asc.
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let store = VectorStore::open_in_memory().await.unwrap();
        store.insert_document(&make_doc("d1")).await.unwrap();
        store
            .store_chunks(&[make_chunk("c1", "d1", vec![1.0, 0.0], 1)])
            .await
            .unwrap();

        let err = store
            .store_chunks(&[make_chunk("c2", "d1", vec![1.0, 0.0, 0.0], 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
        assert_eq!(store.dimension().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_filters_equality() {
        let store = VectorStore::open_in_memory().await.unwrap();
        store.insert_document(&make_doc("d1")).await.unwrap();
        store.insert_document(&make_doc("d2")).await.unwrap();

        let mut programming = make_chunk("c1", "d1", vec![1.0, 0.0], 1);
        programming
            .metadata
            .insert("topic".into(), json!("programming"));
        let mut database = make_chunk("c2", "d2", vec![1.0, 0.0], 2);
        database.metadata.insert("topic".into(), json!("database"));

        store.store_chunks(&[programming, database]).await.unwrap();

        let mut filters = Metadata::new();
        filters.insert("topic".into(), json!("database"));
        let results = store
            .search_with_filters(&[1.0, 0.0], 10, &filters)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, "d2");

        // Empty filter map behaves like no filter.
        let all = store
            .search_with_filters(&[1.0, 0.0], 10, &Metadata::new())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_top_k_zero_returns_empty() {
        let store = VectorStore::open_in_memory().await.unwrap();
        let results = store.search(&[1.0, 0.0], 0).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = VectorStore::open_in_memory().await.unwrap();
        store.insert_document(&make_doc("d1")).await.unwrap();
        store
            .store_chunks(&[
                make_chunk("c1", "d1", vec![1.0], 1),
                make_chunk("c2", "d1", vec![0.5], 2),
            ])
            .await
            .unwrap();

        store.delete_document("d1").await.unwrap();
        assert!(store.list_documents().await.unwrap().is_empty());
        assert_eq!(store.chunk_count().await.unwrap(), 0);

        let err = store.delete_document("d1").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let store = VectorStore::open_in_memory().await.unwrap();
        store.insert_document(&make_doc("d1")).await.unwrap();
        store
            .store_chunks(&[make_chunk("c1", "d1", vec![1.0, 2.0], 1)])
            .await
            .unwrap();

        store.reset().await.unwrap();
        assert!(store.search(&[1.0, 2.0], 5).await.unwrap().is_empty());
        assert_eq!(store.dimension().await.unwrap(), None);
        assert_eq!(store.document_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replace_document_atomic() {
        let store = VectorStore::open_in_memory().await.unwrap();
        let doc = make_doc("d1");
        store
            .replace_document(
                &doc,
                &[
                    make_chunk("c1", "d1", vec![1.0, 0.0], 1),
                    make_chunk("c2", "d1", vec![0.0, 1.0], 1),
                ],
            )
            .await
            .unwrap();
        assert_eq!(store.chunk_count().await.unwrap(), 2);

        // Re-ingest with a single new chunk replaces the old two.
        store
            .replace_document(&doc, &[make_chunk("c3", "d1", vec![0.5, 0.5], 2)])
            .await
            .unwrap();
        assert_eq!(store.chunk_count().await.unwrap(), 1);
        let results = store.search(&[0.5, 0.5], 10).await.unwrap();
        assert_eq!(results[0].id, "c3");
    }
}
