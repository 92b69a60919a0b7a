//! Retrieval tools: hybrid/SQL retrieve, report fetch, history listing.

use super::args::{required_str, usize_or};
use super::ToolSurface;
use crate::index::tokenize;
use crate::store::index::SourceType;
use crate::types::error::{NotFoundError, OrchestratorError, ValidationError};
use crate::types::ReportId;

/// `retrieve`: `mode: "index"` searches the hybrid index, `mode: "sql"`
/// runs a guarded read-only query.
pub async fn retrieve(
    surface: &ToolSurface,
    arguments: serde_json::Value,
) -> Result<serde_json::Value, OrchestratorError> {
    let mode = arguments
        .get("mode")
        .and_then(|v| v.as_str())
        .unwrap_or("index");

    match mode {
        "index" => {
            let query = required_str(&arguments, "query")?;
            let k = usize_or(&arguments, "k", 5);
            let scope = match arguments.get("scope").and_then(|v| v.as_str()) {
                Some("report") | Some("reports") => Some(SourceType::Report),
                Some("doc") | Some("docs") => Some(SourceType::Doc),
                _ => None,
            };
            let rerank = arguments
                .get("rerank")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            let hits = surface
                .services()
                .hybrid
                .search(&query, k, scope, rerank)
                .await?;
            Ok(serde_json::Value::Array(
                hits.into_iter().map(hit_to_json).collect(),
            ))
        }
        "sql" => {
            let sql = required_str(&arguments, "sql")?;
            let params = arguments
                .get("params")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let rows = surface.services().store.execute_query(&sql, &params).await?;
            Ok(serde_json::Value::Array(rows))
        }
        other => Err(ValidationError::InvalidValue {
            field: "mode".to_string(),
            reason: format!("unknown mode: {other}"),
        }
        .into()),
    }
}

fn hit_to_json(hit: crate::index::SearchHit) -> serde_json::Value {
    serde_json::json!({
        "doc_id": hit.doc_id,
        "source_type": hit.source_type.as_str(),
        "source_id": hit.source_id,
        "title": hit.title,
        "snippet": hit.snippet,
        "bm25Score": hit.bm25_score,
        "vectorScore": hit.vector_score,
        "hybridScore": hit.hybrid_score,
    })
}

/// `get_report`: modes `full`, `truncate`, `summary`, `smart`.
pub async fn get_report(
    surface: &ToolSurface,
    arguments: serde_json::Value,
) -> Result<serde_json::Value, OrchestratorError> {
    let report_id: ReportId = arguments
        .get("reportId")
        .or_else(|| arguments.get("report_id"))
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ValidationError::MissingField {
            field: "reportId".to_string(),
        })?;
    let mode = arguments
        .get("mode")
        .and_then(|v| v.as_str())
        .unwrap_or("full");

    let report = surface
        .services()
        .store
        .get_report_by_id(report_id)
        .await?
        .ok_or(NotFoundError::Report(report_id))?;

    let _ = surface
        .services()
        .store
        .increment_usage("report", &report_id.to_string())
        .await;

    let text = match mode {
        "full" => report.final_report.clone(),
        "truncate" => {
            let max_chars = usize_or(&arguments, "maxChars", 2_000);
            report.final_report.chars().take(max_chars).collect()
        }
        "summary" => {
            let head: String = report.final_report.lines().take(10).collect::<Vec<_>>().join("\n");
            format!(
                "Report {} — \"{}\" ({} iterations, {} sub-queries, {} tokens)\n\n{head}",
                report.id,
                report.query,
                report.metadata.iterations,
                report.metadata.sub_query_count,
                report.metadata.usage.total_tokens,
            )
        }
        "smart" => {
            let query = arguments
                .get("query")
                .and_then(|v| v.as_str())
                .unwrap_or(&report.query);
            let max_chars = usize_or(&arguments, "maxChars", 2_000);
            smart_excerpt(&report.final_report, query, max_chars)
        }
        other => {
            return Err(ValidationError::InvalidValue {
                field: "mode".to_string(),
                reason: format!("unknown mode: {other}"),
            }
            .into())
        }
    };

    Ok(serde_json::json!({
        "report_id": report.id,
        "query": report.query,
        "mode": mode,
        "text": text,
        "created_at": report.created_at.to_rfc3339(),
        "accuracy_score": report.accuracy_score,
    }))
}

/// Pick the paragraphs with the highest term overlap with the query, in
/// document order, up to the character budget.
fn smart_excerpt(text: &str, query: &str, max_chars: usize) -> String {
    let query_terms: std::collections::HashSet<String> = tokenize(query).into_iter().collect();
    if query_terms.is_empty() {
        return text.chars().take(max_chars).collect();
    }

    let paragraphs: Vec<&str> = text.split("\n\n").collect();
    let mut scored: Vec<(usize, usize)> = paragraphs
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let overlap = tokenize(p)
                .into_iter()
                .filter(|t| query_terms.contains(t))
                .count();
            (i, overlap)
        })
        .filter(|(_, overlap)| *overlap > 0)
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1));

    let mut chosen: Vec<usize> = Vec::new();
    let mut budget = 0usize;
    for (index, _) in scored {
        let len = paragraphs[index].len();
        if budget + len > max_chars && !chosen.is_empty() {
            break;
        }
        chosen.push(index);
        budget += len;
        if budget >= max_chars {
            break;
        }
    }

    if chosen.is_empty() {
        return text.chars().take(max_chars).collect();
    }
    chosen.sort_unstable();
    chosen
        .into_iter()
        .map(|i| paragraphs[i])
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// `list_research_history`: human-readable recent-report listing.
pub async fn list_research_history(
    surface: &ToolSurface,
    arguments: serde_json::Value,
) -> Result<serde_json::Value, OrchestratorError> {
    let limit = usize_or(&arguments, "limit", 10);
    let filter = arguments
        .get("queryFilter")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let reports = surface
        .services()
        .store
        .list_recent_reports(limit, filter.as_deref())
        .await?;

    if reports.is_empty() {
        return Ok(serde_json::json!({ "listing": "No research reports yet." }));
    }

    let mut listing = String::new();
    for report in &reports {
        listing.push_str(&format!(
            "#{} [{}] {} — {} tokens, {} sub-queries\n",
            report.id,
            report.created_at.format("%Y-%m-%d %H:%M"),
            report.query,
            report.metadata.usage.total_tokens,
            report.metadata.sub_query_count,
        ));
    }
    Ok(serde_json::json!({ "listing": listing, "count": reports.len() }))
}

#[cfg(test)]
mod tests {
    use super::super::ToolSurface;
    use super::smart_excerpt;
    use crate::server::testutil::scripted_services;
    use crate::store::index::SourceType;
    use crate::types::RequestId;

    async fn surface(dir: &tempfile::TempDir) -> ToolSurface {
        ToolSurface::new(scripted_services(vec![], dir).await)
    }

    #[tokio::test]
    async fn index_mode_returns_ranked_hits() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;
        surface
            .services()
            .hybrid
            .index_document(
                SourceType::Doc,
                "d1",
                "B-tree variants",
                "Includes the copy-on-write B-epsilon tree.",
            )
            .await
            .unwrap();

        let hits = surface
            .dispatch(
                "retrieve",
                serde_json::json!({ "mode": "index", "query": "copy-on-write B-epsilon tree", "k": 5 }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();
        let hits = hits.as_array().unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0]["source_id"], "d1");
        assert!(hits[0]["hybridScore"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn sql_mode_is_guarded() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;

        let rows = surface
            .dispatch(
                "retrieve",
                serde_json::json!({ "mode": "sql", "sql": "SELECT COUNT(*) AS n FROM reports" }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();
        assert_eq!(rows.as_array().unwrap()[0]["n"], 0);

        let err = surface
            .dispatch(
                "retrieve",
                serde_json::json!({ "mode": "sql", "sql": "DELETE FROM reports" }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[tokio::test]
    async fn get_report_modes() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;
        let store = &surface.services().store;

        let long_text = format!(
            "Intro paragraph about databases.\n\n{}\n\nThe B-epsilon tree batches writes.",
            "Filler paragraph. ".repeat(50)
        );
        let id = store
            .save_report(crate::store::reports::NewReport {
                query: "b-epsilon trees".into(),
                params: crate::types::ResearchParams::new("b-epsilon trees"),
                final_report: long_text,
                metadata: Default::default(),
                based_on: vec![],
                embedding: None,
            })
            .await
            .unwrap();

        let full = surface
            .dispatch(
                "get_report",
                serde_json::json!({ "reportId": id, "mode": "full" }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();
        assert!(full["text"].as_str().unwrap().contains("batches writes"));

        let truncated = surface
            .dispatch(
                "get_report",
                serde_json::json!({ "reportId": id, "mode": "truncate", "maxChars": 20 }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();
        assert_eq!(truncated["text"].as_str().unwrap().chars().count(), 20);

        let smart = surface
            .dispatch(
                "get_report",
                serde_json::json!({ "reportId": id, "mode": "smart", "query": "B-epsilon batching" }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();
        assert!(smart["text"].as_str().unwrap().contains("B-epsilon tree"));

        let err = surface
            .dispatch(
                "get_report",
                serde_json::json!({ "reportId": 9999 }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), "not_found");
    }

    #[tokio::test]
    async fn history_listing_filters() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;
        for query in ["rust atomics", "go channels"] {
            surface
                .services()
                .store
                .save_report(crate::store::reports::NewReport {
                    query: query.into(),
                    params: crate::types::ResearchParams::new(query),
                    final_report: "text".into(),
                    metadata: Default::default(),
                    based_on: vec![],
                    embedding: None,
                })
                .await
                .unwrap();
        }

        let listing = surface
            .dispatch(
                "list_research_history",
                serde_json::json!({ "limit": 10, "queryFilter": "rust" }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();
        assert_eq!(listing["count"], 1);
        assert!(listing["listing"].as_str().unwrap().contains("rust atomics"));
    }

    #[test]
    fn smart_excerpt_prefers_overlapping_paragraphs() {
        let text = "About cooking pasta.\n\nThe raft protocol elects leaders.\n\nGardening tips.";
        let excerpt = smart_excerpt(text, "raft leader election", 200);
        assert!(excerpt.contains("raft protocol"));
        assert!(!excerpt.contains("Gardening"));
    }
}
