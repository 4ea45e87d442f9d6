//! End-to-end pipeline scenarios: ingest, query, filters, deletion,
//! reset, and conversation flow over an in-memory store.

mod common;

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{make_client, ContextEchoGenerator, HashEmbedder};
use ragkit::error::Error;
use ragkit::message::{ConversationHistory, Role};
use ragkit::models::{IngestRequest, Metadata, QueryRequest};

fn ingest_text(text: &str, id: &str) -> IngestRequest {
    IngestRequest {
        content: Some(text.to_string()),
        document_id: Some(id.to_string()),
        ..IngestRequest::default()
    }
}

#[tokio::test]
async fn test_plain_ingest_and_query() {
    let client = make_client(Arc::new(ContextEchoGenerator)).await;
    let cancel = CancellationToken::new();

    let response = client
        .ingest(
            &ingest_text(
                "Go is a programming language developed by Google.",
                "doc1",
            ),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(response.document_id, "doc1");
    assert!(response.chunk_count >= 1);

    let request = QueryRequest {
        query: "Who developed Go?".to_string(),
        top_k: 1,
        show_sources: true,
        ..QueryRequest::default()
    };
    let answer = client.query(&request, &cancel).await.unwrap();

    assert_eq!(answer.sources.len(), 1);
    assert_eq!(answer.sources[0].document_id, "doc1");
    assert!(
        answer.answer.to_lowercase().contains("google"),
        "answer should carry the retrieved fact: {}",
        answer.answer
    );
    assert!(answer.tool_calls.is_empty());
}

#[tokio::test]
async fn test_filtered_query_restricts_sources() {
    let client = make_client(Arc::new(ContextEchoGenerator)).await;
    let cancel = CancellationToken::new();

    let mut programming = ingest_text("Rust is a systems programming language.", "prog");
    programming
        .metadata
        .insert("topic".to_string(), json!("programming"));
    client.ingest(&programming, &cancel).await.unwrap();

    let mut database = ingest_text("PostgreSQL is a relational database.", "db");
    database
        .metadata
        .insert("topic".to_string(), json!("database"));
    client.ingest(&database, &cancel).await.unwrap();

    let mut filters = Metadata::new();
    filters.insert("topic".to_string(), json!("database"));
    let request = QueryRequest {
        query: "tell me about software".to_string(),
        top_k: 10,
        show_sources: true,
        filters,
        ..QueryRequest::default()
    };
    let answer = client.query(&request, &cancel).await.unwrap();

    assert!(!answer.sources.is_empty());
    for source in &answer.sources {
        assert_eq!(source.document_id, "db");
        assert_eq!(source.metadata.get("topic"), Some(&json!("database")));
    }
}

#[tokio::test]
async fn test_reingest_replaces_chunks() {
    let client = make_client(Arc::new(ContextEchoGenerator)).await;
    let cancel = CancellationToken::new();

    client
        .ingest(&ingest_text("Version one of the document.", "doc"), &cancel)
        .await
        .unwrap();
    let first = client.status().await.unwrap();

    client
        .ingest(&ingest_text("Version two of the document.", "doc"), &cancel)
        .await
        .unwrap();
    let second = client.status().await.unwrap();

    assert_eq!(first.document_count, 1);
    assert_eq!(second.document_count, 1);
    assert_eq!(first.chunk_count, second.chunk_count);

    let doc = client.get_document("doc").await.unwrap();
    assert!(doc.content.contains("Version two"));
}

#[tokio::test]
async fn test_delete_cascades_and_search_forgets() {
    let client = make_client(Arc::new(ContextEchoGenerator)).await;
    let cancel = CancellationToken::new();

    client
        .ingest(&ingest_text("Ephemeral document content.", "gone"), &cancel)
        .await
        .unwrap();
    client.delete_document("gone").await.unwrap();

    assert!(client.list_documents().await.unwrap().is_empty());
    assert_eq!(client.status().await.unwrap().chunk_count, 0);

    let request = QueryRequest {
        query: "ephemeral content".to_string(),
        top_k: 5,
        show_sources: true,
        ..QueryRequest::default()
    };
    let answer = client.query(&request, &cancel).await.unwrap();
    assert!(answer.sources.is_empty());

    assert!(matches!(
        client.delete_document("gone").await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn test_reset_empties_everything() {
    let client = make_client(Arc::new(ContextEchoGenerator)).await;
    let cancel = CancellationToken::new();

    client
        .ingest(&ingest_text("Some content to wipe.", "a"), &cancel)
        .await
        .unwrap();
    client
        .ingest(&ingest_text("More content to wipe.", "b"), &cancel)
        .await
        .unwrap();
    client.reset().await.unwrap();

    let status = client.status().await.unwrap();
    assert_eq!(status.document_count, 0);
    assert_eq!(status.chunk_count, 0);
    assert_eq!(status.dimension, None);
}

#[tokio::test]
async fn test_ingest_rejects_ambiguous_sources() {
    let client = make_client(Arc::new(ContextEchoGenerator)).await;
    let cancel = CancellationToken::new();

    let request = IngestRequest {
        content: Some("text".to_string()),
        url: Some("http://example.com".to_string()),
        ..IngestRequest::default()
    };
    assert!(matches!(
        client.ingest(&request, &cancel).await.unwrap_err(),
        Error::InvalidArg(_)
    ));

    assert!(matches!(
        client
            .ingest(&IngestRequest::default(), &cancel)
            .await
            .unwrap_err(),
        Error::InvalidArg(_)
    ));
}

#[tokio::test]
async fn test_query_validation() {
    let client = make_client(Arc::new(ContextEchoGenerator)).await;
    let cancel = CancellationToken::new();

    let empty = QueryRequest {
        query: "   ".to_string(),
        ..QueryRequest::default()
    };
    assert!(matches!(
        client.query(&empty, &cancel).await.unwrap_err(),
        Error::InvalidArg(_)
    ));

    let hot = QueryRequest {
        query: "q".to_string(),
        temperature: 9.0,
        ..QueryRequest::default()
    };
    assert!(matches!(
        client.query(&hot, &cancel).await.unwrap_err(),
        Error::InvalidArg(_)
    ));
}

#[tokio::test]
async fn test_conversation_trim_invariant() {
    let client = make_client(Arc::new(ContextEchoGenerator)).await;
    let cancel = CancellationToken::new();

    let mut history = ConversationHistory::new("S", 4).unwrap();
    for i in 0..3 {
        client
            .chat(&mut history, &format!("question {i}"), &cancel)
            .await
            .unwrap();
    }

    assert_eq!(history.len(), 4);
    assert_eq!(history.messages()[0].role, Role::System);
    assert_eq!(history.messages()[0].content, "S");
}

#[tokio::test]
async fn test_chat_with_rag_uses_ingested_context() {
    let client = make_client(Arc::new(ContextEchoGenerator)).await;
    let cancel = CancellationToken::new();

    client
        .ingest(
            &ingest_text("The capital of France is Paris.", "facts"),
            &cancel,
        )
        .await
        .unwrap();

    let mut history = ConversationHistory::new("You are helpful.", 10).unwrap();
    let (answer, sources) = client
        .chat_with_rag(
            &mut history,
            "What is the capital of France?",
            &Metadata::new(),
            &cancel,
        )
        .await
        .unwrap();

    assert!(!sources.is_empty());
    assert!(answer.contains("Paris"));
    // The stored user turn is the composed prompt, context included.
    assert!(history.messages()[1].content.contains("Paris"));
}

#[tokio::test]
async fn test_streaming_query_accumulates() {
    let client = make_client(Arc::new(ContextEchoGenerator)).await;
    let cancel = CancellationToken::new();

    client
        .ingest(&ingest_text("Streaming test content.", "s1"), &cancel)
        .await
        .unwrap();

    let request = QueryRequest {
        query: "streaming test".to_string(),
        top_k: 1,
        ..QueryRequest::default()
    };

    let mut streamed = String::new();
    let response = client
        .query_stream(&request, &mut |chunk: &str| streamed.push_str(chunk), &cancel)
        .await
        .unwrap();

    assert!(!streamed.is_empty());
    assert_eq!(streamed, response.answer);
}

#[tokio::test]
async fn test_cancelled_query_reports_canceled() {
    let client = make_client(Arc::new(ContextEchoGenerator)).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    // Retrieval happens before the provider turn, so use top_k = 0 to hit
    // the generation stage directly.
    let request = QueryRequest {
        query: "anything".to_string(),
        top_k: 0,
        ..QueryRequest::default()
    };
    let err = client.query(&request, &cancel).await.unwrap_err();
    assert!(err.is_canceled());
}

#[tokio::test]
async fn test_on_disk_store_survives_reopen() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("data").join("ragkit.sqlite");
    let cancel = CancellationToken::new();

    {
        let store = Arc::new(ragkit::store::VectorStore::open(&path).await.unwrap());
        let client = ragkit::client::RagClient::with_components(
            ragkit::config::Config::default(),
            store,
            Arc::new(HashEmbedder::new()),
            Arc::new(ContextEchoGenerator),
        )
        .await
        .unwrap();
        client
            .ingest(&ingest_text("Persistent fact: water boils at 100C.", "p1"), &cancel)
            .await
            .unwrap();
    }

    // A fresh client over the same path sees the data.
    let store = Arc::new(ragkit::store::VectorStore::open(&path).await.unwrap());
    let client = ragkit::client::RagClient::with_components(
        ragkit::config::Config::default(),
        store,
        Arc::new(HashEmbedder::new()),
        Arc::new(ContextEchoGenerator),
    )
    .await
    .unwrap();

    let status = client.status().await.unwrap();
    assert_eq!(status.document_count, 1);
    assert!(status.chunk_count >= 1);
    assert!(status.dimension.is_some());

    let request = QueryRequest {
        query: "At what temperature does water boil?".to_string(),
        top_k: 1,
        show_sources: true,
        ..QueryRequest::default()
    };
    let answer = client.query(&request, &cancel).await.unwrap();
    assert_eq!(answer.sources[0].document_id, "p1");
}

#[tokio::test]
async fn test_store_dimension_is_sticky() {
    let store = Arc::new(ragkit::store::VectorStore::open_in_memory().await.unwrap());
    let client = ragkit::client::RagClient::with_components(
        ragkit::config::Config::default(),
        store.clone(),
        Arc::new(HashEmbedder { dims: 8 }),
        Arc::new(ContextEchoGenerator),
    )
    .await
    .unwrap();
    let cancel = CancellationToken::new();

    client
        .ingest(&ingest_text("Dimension fixing text.", "d"), &cancel)
        .await
        .unwrap();
    assert_eq!(store.dimension().await.unwrap(), Some(8));
}
