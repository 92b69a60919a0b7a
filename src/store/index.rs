//! Inverted-index tables and document vectors backing the hybrid index.
//!
//! Invariant: for every posting (term, doc, tf) there is a term row whose
//! `df` counts the distinct documents containing the term; re-indexing a
//! document removes its old postings and decrements `df` before inserting.

use rusqlite::{params, Row};

use super::{blob_to_vec, now_rfc3339, vec_to_blob, OptionalExt, ResearchStore};
use crate::embedding::cosine_similarity;
use crate::types::error::StorageError;

/// Origin of an indexed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Report,
    Doc,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Report => "report",
            SourceType::Doc => "doc",
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report" => Ok(SourceType::Report),
            "doc" => Ok(SourceType::Doc),
            other => Err(format!("unknown source type: {other}")),
        }
    }
}

/// A stored index document.
#[derive(Debug, Clone)]
pub struct IndexDocument {
    pub id: i64,
    pub source_type: SourceType,
    pub source_id: String,
    pub title: String,
    pub content: String,
    pub doc_len: u32,
    pub doc_embedding: Option<Vec<f32>>,
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<Result<IndexDocument, StorageError>> {
    let id: i64 = row.get(0)?;
    let source_type_str: String = row.get(1)?;
    let source_id: String = row.get(2)?;
    let title: String = row.get(3)?;
    let content: String = row.get(4)?;
    let doc_len: i64 = row.get(5)?;
    let embedding_blob: Option<Vec<u8>> = row.get(6)?;

    Ok((|| -> Result<IndexDocument, StorageError> {
        Ok(IndexDocument {
            id,
            source_type: source_type_str
                .parse()
                .map_err(|e: String| StorageError::database(e))?,
            source_id,
            title,
            content,
            doc_len: doc_len as u32,
            doc_embedding: embedding_blob.map(|b| blob_to_vec(&b)),
        })
    })())
}

const DOC_COLUMNS: &str =
    "id, source_type, source_id, title, content, doc_len, doc_embedding";

impl ResearchStore {
    /// Upsert a document and its postings in one transaction.
    ///
    /// `term_freqs` are the tokenized term frequencies of title+content;
    /// `doc_len` is the token count after tokenization.
    pub async fn upsert_index_document(
        &self,
        source_type: SourceType,
        source_id: &str,
        title: &str,
        content: &str,
        doc_len: u32,
        term_freqs: &[(String, u32)],
        embedding: Option<Vec<f32>>,
    ) -> Result<i64, StorageError> {
        let source_id = source_id.to_string();
        let title = title.to_string();
        let content = content.to_string();
        let term_freqs = term_freqs.to_vec();
        self.with_retry("upsert_index_document", move |conn| {
            let tx = conn.unchecked_transaction()?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM index_documents WHERE source_type = ?1 AND source_id = ?2",
                    params![source_type.as_str(), source_id],
                    |row| row.get(0),
                )
                .optional()?;

            let doc_id = match existing {
                Some(doc_id) => {
                    // Retract old postings and their df contributions.
                    tx.execute(
                        "UPDATE index_terms SET df = df - 1
                         WHERE term IN (SELECT term FROM index_postings WHERE doc_id = ?1)",
                        params![doc_id],
                    )?;
                    tx.execute(
                        "DELETE FROM index_postings WHERE doc_id = ?1",
                        params![doc_id],
                    )?;
                    tx.execute("DELETE FROM index_terms WHERE df <= 0", [])?;
                    tx.execute(
                        "UPDATE index_documents
                         SET title = ?1, content = ?2, doc_len = ?3, doc_embedding = ?4
                         WHERE id = ?5",
                        params![
                            title,
                            content,
                            doc_len as i64,
                            embedding.as_deref().map(vec_to_blob),
                            doc_id
                        ],
                    )?;
                    doc_id
                }
                None => {
                    tx.execute(
                        "INSERT INTO index_documents
                            (source_type, source_id, title, content, doc_len, doc_embedding,
                             created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            source_type.as_str(),
                            source_id,
                            title,
                            content,
                            doc_len as i64,
                            embedding.as_deref().map(vec_to_blob),
                            now_rfc3339()
                        ],
                    )?;
                    tx.last_insert_rowid()
                }
            };

            for (term, tf) in &term_freqs {
                tx.execute(
                    "INSERT INTO index_postings (term, doc_id, tf) VALUES (?1, ?2, ?3)",
                    params![term, doc_id, *tf.max(&1) as i64],
                )?;
                tx.execute(
                    "INSERT INTO index_terms (term, df) VALUES (?1, 1)
                     ON CONFLICT(term) DO UPDATE SET df = df + 1",
                    params![term],
                )?;
            }

            tx.commit()?;
            Ok(doc_id)
        })
        .await
    }

    /// Postings for the given terms: (term, doc_id, tf).
    pub async fn postings_for_terms(
        &self,
        terms: &[String],
    ) -> Result<Vec<(String, i64, u32)>, StorageError> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let terms = terms.to_vec();
        self.with_retry("postings_for_terms", move |conn| {
            let placeholders = vec!["?"; terms.len()].join(",");
            let sql = format!(
                "SELECT term, doc_id, tf FROM index_postings WHERE term IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let refs: Vec<&dyn rusqlite::types::ToSql> =
                terms.iter().map(|t| t as &dyn rusqlite::types::ToSql).collect();
            let mut rows = stmt.query(refs.as_slice())?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)? as u32,
                ));
            }
            Ok(out)
        })
        .await
    }

    /// Document frequency for the given terms.
    pub async fn term_dfs(
        &self,
        terms: &[String],
    ) -> Result<std::collections::HashMap<String, u32>, StorageError> {
        if terms.is_empty() {
            return Ok(Default::default());
        }
        let terms = terms.to_vec();
        self.with_retry("term_dfs", move |conn| {
            let placeholders = vec!["?"; terms.len()].join(",");
            let sql = format!("SELECT term, df FROM index_terms WHERE term IN ({placeholders})");
            let mut stmt = conn.prepare(&sql)?;
            let refs: Vec<&dyn rusqlite::types::ToSql> =
                terms.iter().map(|t| t as &dyn rusqlite::types::ToSql).collect();
            let mut rows = stmt.query(refs.as_slice())?;
            let mut out = std::collections::HashMap::new();
            while let Some(row) = rows.next()? {
                out.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u32);
            }
            Ok(out)
        })
        .await
    }

    /// Corpus statistics: document count and mean document length.
    pub async fn corpus_stats(&self) -> Result<(u64, f64), StorageError> {
        self.with_retry("corpus_stats", |conn| {
            let (count, avg): (i64, Option<f64>) = conn.query_row(
                "SELECT COUNT(*), AVG(doc_len) FROM index_documents",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok((count as u64, avg.unwrap_or(0.0)))
        })
        .await
    }

    /// Fetch documents by id, in the given order.
    pub async fn get_index_documents(
        &self,
        ids: &[i64],
    ) -> Result<Vec<IndexDocument>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let requested = ids.to_vec();
        let ids = ids.to_vec();
        let mut fetched = self
            .with_retry("get_index_documents", move |conn| {
                let placeholders = vec!["?"; ids.len()].join(",");
                let sql =
                    format!("SELECT {DOC_COLUMNS} FROM index_documents WHERE id IN ({placeholders})");
                let mut stmt = conn.prepare(&sql)?;
                let refs: Vec<&dyn rusqlite::types::ToSql> =
                    ids.iter().map(|i| i as &dyn rusqlite::types::ToSql).collect();
                let mut rows = stmt.query(refs.as_slice())?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_document(row)??);
                }
                Ok(out)
            })
            .await?;

        // Restore requested order.
        let position: std::collections::HashMap<i64, usize> = requested
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        fetched.sort_by_key(|d| position.get(&d.id).copied().unwrap_or(usize::MAX));
        Ok(fetched)
    }

    /// Vector-score all embedded documents against a query embedding,
    /// optionally restricted to one source type. Returns (doc_id, cosine)
    /// sorted descending, truncated to `limit`.
    pub async fn top_vector_documents(
        &self,
        query_embedding: &[f32],
        source_type: Option<SourceType>,
        limit: usize,
    ) -> Result<Vec<(i64, f32)>, StorageError> {
        let query_embedding = query_embedding.to_vec();
        self.with_retry("top_vector_documents", move |conn| {
            let sql = match source_type {
                Some(_) => {
                    "SELECT id, doc_embedding FROM index_documents
                     WHERE doc_embedding IS NOT NULL AND source_type = ?1"
                }
                None => "SELECT id, doc_embedding FROM index_documents WHERE doc_embedding IS NOT NULL",
            };
            let mut stmt = conn.prepare(sql)?;
            let mut scored: Vec<(i64, f32)> = Vec::new();
            let mut handle_rows = |rows: &mut rusqlite::Rows<'_>| -> Result<(), StorageError> {
                while let Some(row) = rows.next()? {
                    let id: i64 = row.get(0)?;
                    let blob: Vec<u8> = row.get(1)?;
                    scored.push((id, cosine_similarity(&query_embedding, &blob_to_vec(&blob))));
                }
                Ok(())
            };
            match source_type {
                Some(st) => handle_rows(&mut stmt.query(params![st.as_str()])?)?,
                None => handle_rows(&mut stmt.query([])?)?,
            }
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(limit);
            Ok(scored)
        })
        .await
    }

    /// Index status counters: (documents, terms, postings, embedded docs).
    pub async fn index_counts(&self) -> Result<(u64, u64, u64, u64), StorageError> {
        self.with_retry("index_counts", |conn| {
            let docs: i64 =
                conn.query_row("SELECT COUNT(*) FROM index_documents", [], |r| r.get(0))?;
            let terms: i64 = conn.query_row("SELECT COUNT(*) FROM index_terms", [], |r| r.get(0))?;
            let postings: i64 =
                conn.query_row("SELECT COUNT(*) FROM index_postings", [], |r| r.get(0))?;
            let embedded: i64 = conn.query_row(
                "SELECT COUNT(*) FROM index_documents WHERE doc_embedding IS NOT NULL",
                [],
                |r| r.get(0),
            )?;
            Ok((docs as u64, terms as u64, postings as u64, embedded as u64))
        })
        .await
    }

    /// Re-embed documents whose stored embedding is missing or stale.
    pub async fn reindex_document_vectors(&self) -> Result<usize, StorageError> {
        let rows: Vec<(i64, String)> = self
            .with_retry("reindex_docs_collect", |conn| {
                let expected = (self.embedder().dimension() * 4) as i64;
                let mut stmt = conn.prepare(
                    "SELECT id, title || ' ' || content FROM index_documents
                     WHERE doc_embedding IS NULL OR LENGTH(doc_embedding) != ?1",
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
        let texts: Vec<String> = rows.iter().map(|(_, t)| t.clone()).collect();
        let Some(embeddings) = self.embedder().embed_batch(&texts).await else {
            return Ok(0);
        };

        let updates: Vec<(i64, Vec<u8>)> = rows
            .iter()
            .zip(embeddings.iter())
            .map(|((id, _), emb)| (*id, vec_to_blob(emb)))
            .collect();
        let updated = updates.len();

        self.with_retry("reindex_docs_write", move |conn| {
            for (id, blob) in &updates {
                conn.execute(
                    "UPDATE index_documents SET doc_embedding = ?1 WHERE id = ?2",
                    params![blob, id],
                )?;
            }
            Ok(())
        })
        .await?;

        tracing::info!(updated, "reindexed document embeddings");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::memory_store;

    fn tf(pairs: &[(&str, u32)]) -> Vec<(String, u32)> {
        pairs.iter().map(|(t, f)| (t.to_string(), *f)).collect()
    }

    #[tokio::test]
    async fn upsert_maintains_df_invariant() {
        let store = memory_store().await;

        store
            .upsert_index_document(
                SourceType::Doc,
                "d1",
                "btree",
                "btree variants",
                2,
                &tf(&[("btree", 2), ("variants", 1)]),
                None,
            )
            .await
            .unwrap();
        store
            .upsert_index_document(
                SourceType::Doc,
                "d2",
                "lsm",
                "lsm and btree",
                3,
                &tf(&[("lsm", 1), ("btree", 1)]),
                None,
            )
            .await
            .unwrap();

        let dfs = store
            .term_dfs(&["btree".into(), "lsm".into(), "variants".into()])
            .await
            .unwrap();
        assert_eq!(dfs["btree"], 2);
        assert_eq!(dfs["lsm"], 1);
        assert_eq!(dfs["variants"], 1);
    }

    #[tokio::test]
    async fn reindexing_same_doc_does_not_inflate_df() {
        let store = memory_store().await;
        for _ in 0..3 {
            store
                .upsert_index_document(
                    SourceType::Doc,
                    "d1",
                    "title",
                    "body",
                    2,
                    &tf(&[("title", 1), ("body", 1)]),
                    None,
                )
                .await
                .unwrap();
        }
        let dfs = store.term_dfs(&["title".into(), "body".into()]).await.unwrap();
        assert_eq!(dfs["title"], 1);
        assert_eq!(dfs["body"], 1);

        let (docs, terms, postings, _) = store.index_counts().await.unwrap();
        assert_eq!(docs, 1);
        assert_eq!(terms, 2);
        assert_eq!(postings, 2);
    }

    #[tokio::test]
    async fn postings_lookup() {
        let store = memory_store().await;
        let doc_id = store
            .upsert_index_document(
                SourceType::Doc,
                "d1",
                "t",
                "c",
                1,
                &tf(&[("epsilon", 4)]),
                None,
            )
            .await
            .unwrap();

        let postings = store.postings_for_terms(&["epsilon".into()]).await.unwrap();
        assert_eq!(postings, vec![("epsilon".to_string(), doc_id, 4)]);
        assert!(store.postings_for_terms(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn vector_candidates_ranked_by_cosine() {
        let store = memory_store().await;
        let embedder = store.embedder().clone();
        let target = embedder.embed("copy on write b epsilon tree").await.unwrap();

        for (id, text) in [
            ("a", "copy on write b epsilon tree"),
            ("b", "unrelated gardening tips"),
        ] {
            let emb = embedder.embed(text).await.unwrap();
            store
                .upsert_index_document(SourceType::Report, id, text, text, 5, &[], Some(emb))
                .await
                .unwrap();
        }

        let top = store
            .top_vector_documents(&target, Some(SourceType::Report), 2)
            .await
            .unwrap();
        assert_eq!(top.len(), 2);
        assert!(top[0].1 > top[1].1);

        let docs = store.get_index_documents(&[top[0].0]).await.unwrap();
        assert_eq!(docs[0].source_id, "a");
    }

    #[tokio::test]
    async fn corpus_stats_track_lengths() {
        let store = memory_store().await;
        store
            .upsert_index_document(SourceType::Doc, "d1", "t", "c", 10, &[], None)
            .await
            .unwrap();
        store
            .upsert_index_document(SourceType::Doc, "d2", "t", "c", 20, &[], None)
            .await
            .unwrap();
        let (count, avg) = store.corpus_stats().await.unwrap();
        assert_eq!(count, 2);
        assert!((avg - 15.0).abs() < f64::EPSILON);
    }
}
