//! Report persistence: CRUD, feedback, and vector similarity search.

use rusqlite::{params, Connection, Row};

use super::{blob_to_vec, now_rfc3339, parse_rfc3339, vec_to_blob, OptionalExt, ResearchStore};
use crate::embedding::cosine_similarity;
use crate::types::error::StorageError;
use crate::types::{Feedback, Report, ReportId, ResearchMetadata, ResearchParams};

/// Hard floor for the adaptive similarity threshold. Never lowered.
pub const SIMILARITY_FLOOR: f32 = 0.80;

/// A report to persist.
#[derive(Debug, Clone)]
pub struct NewReport {
    pub query: String,
    pub params: ResearchParams,
    pub final_report: String,
    pub metadata: ResearchMetadata,
    pub based_on: Vec<ReportId>,
    pub embedding: Option<Vec<f32>>,
}

/// A similarity-search hit with its raw cosine score.
#[derive(Debug, Clone)]
pub struct SimilarReport {
    pub report: Report,
    pub similarity: f32,
}

fn row_to_report(row: &Row<'_>) -> rusqlite::Result<Result<Report, StorageError>> {
    let id: i64 = row.get(0)?;
    let query: String = row.get(1)?;
    let params_json: String = row.get(2)?;
    let final_report: String = row.get(3)?;
    let metadata_json: String = row.get(4)?;
    let based_on_json: String = row.get(5)?;
    let feedback_json: String = row.get(6)?;
    let accuracy_score: Option<f64> = row.get(7)?;
    let fact_check_json: Option<String> = row.get(8)?;
    let created_str: String = row.get(9)?;
    let updated_str: String = row.get(10)?;

    Ok((|| -> Result<Report, StorageError> {
        let params: ResearchParams = serde_json::from_str(&params_json)
            .map_err(|e| StorageError::database(format!("bad params json: {e}")))?;
        let metadata: ResearchMetadata = serde_json::from_str(&metadata_json)
            .map_err(|e| StorageError::database(format!("bad metadata json: {e}")))?;
        let based_on_past_report_ids: Vec<ReportId> = serde_json::from_str(&based_on_json)
            .map_err(|e| StorageError::database(format!("bad based_on json: {e}")))?;
        let feedback: Vec<Feedback> = serde_json::from_str(&feedback_json)
            .map_err(|e| StorageError::database(format!("bad feedback json: {e}")))?;
        let fact_check = fact_check_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| StorageError::database(format!("bad fact_check json: {e}")))?;
        Ok(Report {
            id,
            query,
            params,
            final_report,
            metadata,
            based_on_past_report_ids,
            feedback,
            accuracy_score,
            fact_check,
            created_at: parse_rfc3339(&created_str)?,
            updated_at: parse_rfc3339(&updated_str)?,
        })
    })())
}

const REPORT_COLUMNS: &str = "id, query, params_json, final_report, metadata_json, based_on_json,
     feedback_json, accuracy_score, fact_check_json, created_at, updated_at";

fn fetch_report(conn: &Connection, id: ReportId) -> Result<Option<Report>, StorageError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REPORT_COLUMNS} FROM reports WHERE id = ?1"
    ))?;
    match stmt.query_row(params![id], row_to_report).optional()? {
        Some(report) => Ok(Some(report?)),
        None => Ok(None),
    }
}

impl ResearchStore {
    /// Persist a report. The final report text must be non-empty.
    pub async fn save_report(&self, report: NewReport) -> Result<ReportId, StorageError> {
        if report.final_report.trim().is_empty() {
            return Err(StorageError::database(
                "refusing to persist a report with empty text",
            ));
        }
        let expected_dim = self.embedder().dimension();
        if let Some(ref embedding) = report.embedding {
            if embedding.len() != expected_dim {
                return Err(StorageError::database(format!(
                    "embedding dimension {} does not match store dimension {}",
                    embedding.len(),
                    expected_dim
                )));
            }
        }

        self.with_retry("save_report", move |conn| {
            let now = now_rfc3339();
            conn.execute(
                "INSERT INTO reports
                    (query, params_json, final_report, metadata_json, based_on_json,
                     feedback_json, query_embedding, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, '[]', ?6, ?7, ?7)",
                params![
                    report.query,
                    serde_json::to_string(&report.params)
                        .map_err(|e| StorageError::database(e.to_string()))?,
                    report.final_report,
                    serde_json::to_string(&report.metadata)
                        .map_err(|e| StorageError::database(e.to_string()))?,
                    serde_json::to_string(&report.based_on)
                        .map_err(|e| StorageError::database(e.to_string()))?,
                    report.embedding.as_deref().map(vec_to_blob),
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Fetch a report by id.
    pub async fn get_report_by_id(&self, id: ReportId) -> Result<Option<Report>, StorageError> {
        self.with_retry("get_report_by_id", move |conn| fetch_report(conn, id))
            .await
    }

    /// List recent reports, newest first, optionally filtered by a substring
    /// of the original query.
    pub async fn list_recent_reports(
        &self,
        limit: usize,
        query_filter: Option<&str>,
    ) -> Result<Vec<Report>, StorageError> {
        let filter = query_filter.map(|s| s.to_string());
        self.with_retry("list_recent_reports", move |conn| {
            let (sql, pattern);
            match &filter {
                Some(f) => {
                    sql = format!(
                        "SELECT {REPORT_COLUMNS} FROM reports
                         WHERE query LIKE ?1 ORDER BY id DESC LIMIT ?2"
                    );
                    pattern = Some(format!("%{f}%"));
                }
                None => {
                    sql = format!(
                        "SELECT {REPORT_COLUMNS} FROM reports ORDER BY id DESC LIMIT ?1"
                    );
                    pattern = None;
                }
            }
            let mut stmt = conn.prepare(&sql)?;
            let mut out = Vec::new();
            let mut collect = |rows: &mut rusqlite::Rows<'_>| -> Result<(), StorageError> {
                while let Some(row) = rows.next()? {
                    out.push(row_to_report(row)??);
                }
                Ok(())
            };
            match pattern {
                Some(p) => collect(&mut stmt.query(params![p, limit as i64])?)?,
                None => collect(&mut stmt.query(params![limit as i64])?)?,
            }
            Ok(out)
        })
        .await
    }

    /// Append a feedback entry. Ratings clamp to 1–5. Returns `false` when
    /// the report does not exist.
    pub async fn add_feedback(
        &self,
        id: ReportId,
        rating: u8,
        comment: Option<String>,
    ) -> Result<bool, StorageError> {
        self.with_retry("add_feedback", move |conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT feedback_json FROM reports WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(feedback_json) = existing else {
                return Ok(false);
            };
            let mut feedback: Vec<Feedback> = serde_json::from_str(&feedback_json)
                .map_err(|e| StorageError::database(format!("bad feedback json: {e}")))?;
            feedback.push(Feedback {
                rating: rating.clamp(1, 5),
                comment: comment.clone(),
                created_at: chrono::Utc::now(),
            });
            conn.execute(
                "UPDATE reports SET feedback_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    serde_json::to_string(&feedback)
                        .map_err(|e| StorageError::database(e.to_string()))?,
                    now_rfc3339(),
                    id
                ],
            )?;
            Ok(true)
        })
        .await
    }

    /// Attach a fact-check result to a report.
    pub async fn set_fact_check(
        &self,
        id: ReportId,
        accuracy_score: Option<f64>,
        details: serde_json::Value,
    ) -> Result<bool, StorageError> {
        self.with_retry("set_fact_check", move |conn| {
            let rows = conn.execute(
                "UPDATE reports SET accuracy_score = ?1, fact_check_json = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![accuracy_score, details.to_string(), now_rfc3339(), id],
            )?;
            Ok(rows > 0)
        })
        .await
    }

    /// Most recent report whose query matches exactly.
    pub async fn find_by_exact_query(&self, query: &str) -> Result<Option<Report>, StorageError> {
        let query = query.to_string();
        self.with_retry("find_by_exact_query", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REPORT_COLUMNS} FROM reports WHERE query = ?1 ORDER BY id DESC LIMIT 1"
            ))?;
            match stmt.query_row(params![query], row_to_report).optional()? {
                Some(report) => Ok(Some(report?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Vector similarity search over stored query embeddings.
    ///
    /// No keyword fallback: when the embedder is unavailable this returns
    /// empty. When the requested floor exceeds 0.82 and yields nothing, the
    /// threshold adapts once to `max(0.80, floor - 0.03)`; it never drops
    /// below [`SIMILARITY_FLOOR`].
    pub async fn find_by_similarity(
        &self,
        query_text: &str,
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<SimilarReport>, StorageError> {
        let Some(query_embedding) = self.embedder().embed(query_text).await else {
            return Ok(Vec::new());
        };

        let scored = self
            .with_retry("find_by_similarity", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, query_embedding FROM reports WHERE query_embedding IS NOT NULL",
                )?;
                let mut rows = stmt.query([])?;
                let mut scored: Vec<(i64, f32)> = Vec::new();
                while let Some(row) = rows.next()? {
                    let id: i64 = row.get(0)?;
                    let blob: Vec<u8> = row.get(1)?;
                    let similarity = cosine_similarity(&query_embedding, &blob_to_vec(&blob));
                    scored.push((id, similarity));
                }
                Ok(scored)
            })
            .await?;

        let requested = min_similarity.max(SIMILARITY_FLOOR);
        let mut threshold = requested;
        let mut hits: Vec<(i64, f32)> = scored
            .iter()
            .filter(|(_, s)| *s >= threshold)
            .copied()
            .collect();
        if hits.is_empty() && requested > 0.82 {
            threshold = (requested - 0.03).max(SIMILARITY_FLOOR);
            hits = scored
                .iter()
                .filter(|(_, s)| *s >= threshold)
                .copied()
                .collect();
        }

        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);

        let mut out = Vec::with_capacity(hits.len());
        for (id, similarity) in hits {
            let report = self
                .with_retry("find_by_similarity_fetch", move |conn| fetch_report(conn, id))
                .await?;
            if let Some(report) = report {
                out.push(SimilarReport { report, similarity });
            }
        }
        Ok(out)
    }

    /// Total number of stored reports.
    pub async fn report_count(&self) -> Result<u64, StorageError> {
        self.with_retry("report_count", |conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM reports", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    /// Re-embed report queries whose stored embedding is missing or has a
    /// stale dimension. Returns the number of rows updated.
    pub async fn reindex_report_vectors(&self) -> Result<usize, StorageError> {
        let rows: Vec<(i64, String)> = self
            .with_retry("reindex_collect", |conn| {
                let expected = (self.embedder().dimension() * 4) as i64;
                let mut stmt = conn.prepare(
                    "SELECT id, query FROM reports
                     WHERE query_embedding IS NULL OR LENGTH(query_embedding) != ?1",
                )?;
                let mut out = Vec::new();
                let mut rows = stmt.query(params![expected])?;
                while let Some(row) = rows.next()? {
                    out.push((row.get(0)?, row.get(1)?));
                }
                Ok(out)
            })
            .await?;

        if rows.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = rows.iter().map(|(_, q)| q.clone()).collect();
        let Some(embeddings) = self.embedder().embed_batch(&texts).await else {
            return Ok(0);
        };

        let updates: Vec<(i64, Vec<u8>)> = rows
            .iter()
            .zip(embeddings.iter())
            .map(|((id, _), emb)| (*id, vec_to_blob(emb)))
            .collect();
        let updated = updates.len();

        self.with_retry("reindex_write", move |conn| {
            for (id, blob) in &updates {
                conn.execute(
                    "UPDATE reports SET query_embedding = ?1 WHERE id = ?2",
                    params![blob, id],
                )?;
            }
            Ok(())
        })
        .await?;

        tracing::info!(updated, "reindexed report embeddings");
        Ok(updated)
    }
}
