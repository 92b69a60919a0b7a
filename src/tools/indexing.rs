//! Index tools: text/URL ingestion and direct index search.

use super::args::{required_str, usize_or};
use super::ToolSurface;
use crate::embedding::EmbedderState;
use crate::store::index::SourceType;
use crate::types::error::{OrchestratorError, ValidationError};
use crate::types::RequestId;

/// `index_texts`: ingest an array of documents (strings or `{name,
/// content}` objects).
pub async fn index_texts(
    surface: &ToolSurface,
    arguments: serde_json::Value,
) -> Result<serde_json::Value, OrchestratorError> {
    let docs = arguments
        .get("docs")
        .or_else(|| arguments.get("textDocuments"))
        .and_then(|v| v.as_array())
        .cloned()
        .ok_or_else(|| ValidationError::MissingField {
            field: "docs".to_string(),
        })?;
    if docs.is_empty() {
        return Err(ValidationError::InvalidValue {
            field: "docs".to_string(),
            reason: "empty array".to_string(),
        }
        .into());
    }

    let mut doc_ids = Vec::with_capacity(docs.len());
    for (i, doc) in docs.iter().enumerate() {
        let (name, content) = match doc {
            serde_json::Value::String(s) => (format!("document_{}", i + 1), s.clone()),
            serde_json::Value::Object(map) => {
                let content = map
                    .get("content")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ValidationError::MissingField {
                        field: format!("docs[{i}].content"),
                    })?
                    .to_string();
                let name = map
                    .get("name")
                    .or_else(|| map.get("title"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("document_{}", i + 1));
                (name, content)
            }
            _ => {
                return Err(ValidationError::InvalidValue {
                    field: format!("docs[{i}]"),
                    reason: "expected string or object".to_string(),
                }
                .into())
            }
        };

        let doc_id = surface
            .services()
            .hybrid
            .index_document(SourceType::Doc, &name, &name, &content)
            .await?;
        doc_ids.push(doc_id);
    }

    Ok(serde_json::json!({ "indexed": doc_ids.len(), "doc_ids": doc_ids }))
}

/// `index_url`: fetch a URL (through the `fetch_url` tool) and index the
/// extracted text.
pub async fn index_url(
    surface: &ToolSurface,
    arguments: serde_json::Value,
    request_id: RequestId,
    depth: u8,
) -> Result<serde_json::Value, OrchestratorError> {
    let url = required_str(&arguments, "url")?;

    let fetched = Box::pin(surface.dispatch(
        "fetch_url",
        serde_json::json!({ "url": url }),
        request_id,
        depth + 1,
    ))
    .await?;
    if let Some(error) = fetched.get("error") {
        // Depth cap propagated from the nested call.
        return Ok(serde_json::json!({ "error": error }));
    }

    let content = fetched
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if content.trim().is_empty() {
        return Err(ValidationError::InvalidValue {
            field: "url".to_string(),
            reason: "fetched document is empty".to_string(),
        }
        .into());
    }

    let doc_id = surface
        .services()
        .hybrid
        .index_document(SourceType::Doc, &url, &url, content)
        .await?;
    Ok(serde_json::json!({ "doc_id": doc_id, "url": url }))
}

/// `search_index`: direct hybrid search over everything indexed.
pub async fn search_index(
    surface: &ToolSurface,
    arguments: serde_json::Value,
) -> Result<serde_json::Value, OrchestratorError> {
    let query = required_str(&arguments, "query")?;
    let k = usize_or(&arguments, "k", 5);
    let rerank = arguments
        .get("rerank")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let hits = surface
        .services()
        .hybrid
        .search(&query, k, None, rerank)
        .await?;
    let rows: Vec<serde_json::Value> = hits
        .into_iter()
        .map(|hit| {
            serde_json::json!({
                "doc_id": hit.doc_id,
                "source_type": hit.source_type.as_str(),
                "source_id": hit.source_id,
                "title": hit.title,
                "snippet": hit.snippet,
                "hybridScore": hit.hybrid_score,
            })
        })
        .collect();
    Ok(serde_json::json!({ "results": rows }))
}

/// `index_status`: corpus counters and embedder readiness.
pub async fn index_status(surface: &ToolSurface) -> Result<serde_json::Value, OrchestratorError> {
    let (docs, terms, postings, embedded) = surface.services().store.index_counts().await?;
    let embedder_state = match surface.services().embedder.state() {
        EmbedderState::Uninitialized => "uninitialized",
        EmbedderState::Ready => "ready",
        EmbedderState::Unavailable => "unavailable",
    };
    Ok(serde_json::json!({
        "documents": docs,
        "terms": terms,
        "postings": postings,
        "embedded_documents": embedded,
        "embedder": embedder_state,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::ToolSurface;
    use crate::server::testutil::scripted_services;
    use crate::types::RequestId;

    async fn surface(dir: &tempfile::TempDir) -> ToolSurface {
        ToolSurface::new(scripted_services(vec![], dir).await)
    }

    #[tokio::test]
    async fn index_then_search_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;

        let indexed = surface
            .dispatch(
                "index_texts",
                serde_json::json!({ "docs": [
                    { "name": "btrees.md", "content": "The copy-on-write B-epsilon tree batches updates." },
                    "bare string about hash tables",
                ]}),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();
        assert_eq!(indexed["indexed"], 2);

        // Round-trip law: an exact phrase from a doc finds it on page one.
        let found = surface
            .dispatch(
                "search_index",
                serde_json::json!({ "query": "copy-on-write B-epsilon tree" }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();
        let results = found["results"].as_array().unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0]["source_id"], "btrees.md");
    }

    #[tokio::test]
    async fn index_status_reports_counters() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;
        surface
            .dispatch(
                "index_texts",
                serde_json::json!({ "docs": ["alpha beta gamma"] }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();

        let status = surface
            .dispatch("index_status", serde_json::json!({}), RequestId::new(), 0)
            .await
            .unwrap();
        assert_eq!(status["documents"], 1);
        assert!(status["terms"].as_u64().unwrap() >= 3);
        assert_eq!(status["embedder"], "ready");
    }

    #[tokio::test]
    async fn empty_docs_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;
        let err = surface
            .dispatch(
                "index_texts",
                serde_json::json!({ "docs": [] }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[tokio::test]
    async fn nested_call_depth_is_capped() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;

        // index_url at depth max-1: its nested fetch_url lands on the cap.
        let value = surface
            .dispatch(
                "index_url",
                serde_json::json!({ "url": "https://example.com" }),
                RequestId::new(),
                2,
            )
            .await
            .unwrap();
        assert_eq!(value["error"], "Max recursion depth reached");
    }
}
