//! Hybrid BM25 + vector retrieval over the store's index tables.
//!
//! Indexing tokenizes title+content into postings; search fuses min-max
//! normalized BM25 with cosine similarity on document embeddings, always
//! promoting top-vector report hits so pure-semantic matches survive when
//! the inverted index has no term overlap. An optional LLM rerank re-orders
//! the top window.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::provider::{ChatClient, ChatMessage, ChatOptions};
use crate::store::index::SourceType;
use crate::store::ResearchStore;
use crate::types::error::StorageError;

/// Stopwords removed during tokenization.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is",
    "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "were", "which", "with",
];

/// Maximum number of fused results sent to the reranker.
const RERANK_WINDOW: usize = 50;

/// One hybrid search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub doc_id: i64,
    pub source_type: SourceType,
    pub source_id: String,
    pub title: String,
    pub snippet: String,
    pub bm25_score: f32,
    pub vector_score: f32,
    pub hybrid_score: f32,
}

/// Hybrid index facade over the store tables.
pub struct HybridIndex {
    store: Arc<ResearchStore>,
    chat: Option<Arc<dyn ChatClient>>,
    w_bm25: f32,
    w_vec: f32,
    k1: f32,
    b: f32,
    max_content_len: usize,
    rerank_enabled: bool,
    rerank_model: Option<String>,
}

impl HybridIndex {
    pub fn new(
        store: Arc<ResearchStore>,
        chat: Option<Arc<dyn ChatClient>>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            chat,
            w_bm25: config.index_weight_bm25,
            w_vec: config.index_weight_vector,
            k1: config.bm25_k1,
            b: config.bm25_b,
            max_content_len: config.index_max_content_len,
            rerank_enabled: config.rerank_enabled,
            rerank_model: config.rerank_model.clone(),
        }
    }

    /// Index a document: tokenize, upsert postings, embed (best effort).
    pub async fn index_document(
        &self,
        source_type: SourceType,
        source_id: &str,
        title: &str,
        content: &str,
    ) -> Result<i64, StorageError> {
        let content: String = content.chars().take(self.max_content_len).collect();
        let tokens = tokenize(&format!("{title} {content}"));
        let doc_len = tokens.len() as u32;

        let mut freqs: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            *freqs.entry(token).or_default() += 1;
        }
        let term_freqs: Vec<(String, u32)> = freqs.into_iter().collect();

        let embedding = self
            .store
            .embedder()
            .embed(&format!("{title} {content}"))
            .await;

        self.store
            .upsert_index_document(
                source_type,
                source_id,
                title,
                &content,
                doc_len,
                &term_freqs,
                embedding,
            )
            .await
    }

    /// Index a saved report. Failures are logged and swallowed: indexing is
    /// a side-effect that must never fail the owning operation.
    pub async fn index_report_best_effort(&self, report_id: i64, query: &str, text: &str) {
        if let Err(e) = self
            .index_document(
                SourceType::Report,
                &report_id.to_string(),
                query,
                text,
            )
            .await
        {
            tracing::warn!(report_id, "auto-indexing report failed: {e}");
        }
    }

    /// Hybrid search. `scope` restricts by source type; `rerank` requests
    /// the optional LLM re-ordering of the top window.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        scope: Option<SourceType>,
        rerank: bool,
    ) -> Result<Vec<SearchHit>, StorageError> {
        let terms: Vec<String> = {
            let mut seen = HashSet::new();
            tokenize(query)
                .into_iter()
                .filter(|t| seen.insert(t.clone()))
                .collect()
        };

        let postings = self.store.postings_for_terms(&terms).await?;
        let dfs = self.store.term_dfs(&terms).await?;
        let (n_docs, avg_len) = self.store.corpus_stats().await?;

        // Term frequencies of the query per candidate document.
        let mut doc_terms: HashMap<i64, Vec<(String, u32)>> = HashMap::new();
        for (term, doc_id, tf) in postings {
            doc_terms.entry(doc_id).or_default().push((term, tf));
        }

        let query_embedding = self.store.embedder().embed(query).await;

        // Report promotion: top-vector report docs always join the candidate
        // set so report-scoped semantic matches surface without term overlap.
        let mut candidate_ids: Vec<i64> = doc_terms.keys().copied().collect();
        let mut vector_scores: HashMap<i64, f32> = HashMap::new();
        if let Some(ref embedding) = query_embedding {
            let promoted = self
                .store
                .top_vector_documents(embedding, Some(SourceType::Report), limit.max(5))
                .await?;
            for (doc_id, score) in &promoted {
                vector_scores.insert(*doc_id, *score);
                if !candidate_ids.contains(doc_id) {
                    candidate_ids.push(*doc_id);
                }
            }
        }

        if candidate_ids.is_empty() {
            return Ok(Vec::new());
        }

        let documents = self.store.get_index_documents(&candidate_ids).await?;

        let mut hits: Vec<SearchHit> = Vec::with_capacity(documents.len());
        for doc in &documents {
            if let Some(scope) = scope {
                if doc.source_type != scope {
                    continue;
                }
            }
            let bm25 = doc_terms
                .get(&doc.id)
                .map(|tfs| {
                    bm25_score(
                        tfs,
                        &dfs,
                        n_docs,
                        doc.doc_len,
                        avg_len,
                        self.k1,
                        self.b,
                    )
                })
                .unwrap_or(0.0);
            let vector = vector_scores.get(&doc.id).copied().unwrap_or_else(|| {
                match (&query_embedding, &doc.doc_embedding) {
                    (Some(q), Some(d)) => crate::embedding::cosine_similarity(q, d),
                    _ => 0.0,
                }
            });
            hits.push(SearchHit {
                doc_id: doc.id,
                source_type: doc.source_type,
                source_id: doc.source_id.clone(),
                title: doc.title.clone(),
                snippet: snippet_of(&doc.content),
                bm25_score: bm25,
                vector_score: vector,
                hybrid_score: 0.0,
            });
        }

        // Min-max normalize BM25 over the current result set, then fuse.
        // A degenerate range (single candidate, or all scores equal) maps
        // positive scores to 1 so a lone term match still carries weight.
        let (min_bm25, max_bm25) = hits
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), h| {
                (lo.min(h.bm25_score), hi.max(h.bm25_score))
            });
        let range = max_bm25 - min_bm25;
        for hit in &mut hits {
            let norm_bm25 = if hit.bm25_score <= 0.0 {
                0.0
            } else if range <= f32::EPSILON {
                1.0
            } else {
                (hit.bm25_score - min_bm25) / range
            };
            hit.hybrid_score = self.w_bm25 * norm_bm25 + self.w_vec * hit.vector_score;
        }

        // Usage counters break ties between equally-scored hits.
        let mut keyed: Vec<(SearchHit, u64)> = Vec::with_capacity(hits.len());
        for hit in hits {
            let uses = self
                .store
                .get_usage(hit.source_type.as_str(), &hit.source_id)
                .await
                .unwrap_or(0);
            keyed.push((hit, uses));
        }
        keyed.sort_by(|(a, a_uses), (b, b_uses)| {
            b.hybrid_score
                .partial_cmp(&a.hybrid_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b_uses.cmp(a_uses))
        });
        let mut hits: Vec<SearchHit> = keyed.into_iter().map(|(hit, _)| hit).collect();
        hits.truncate(limit.max(1));

        if rerank && self.rerank_enabled {
            hits = self.rerank_hits(query, hits).await;
        }

        // Opportunistic usage accounting; never fails the search.
        for hit in &hits {
            let _ = self
                .store
                .increment_usage(hit.source_type.as_str(), &hit.source_id)
                .await;
        }

        Ok(hits)
    }

    /// Send the top window to a small model for re-ordering. The model must
    /// answer with a JSON integer array of indices; unknown or duplicate
    /// indices are ignored and unranked items keep their fused order at the
    /// tail.
    async fn rerank_hits(&self, query: &str, hits: Vec<SearchHit>) -> Vec<SearchHit> {
        let Some(chat) = &self.chat else {
            return hits;
        };
        let Some(model) = &self.rerank_model else {
            return hits;
        };
        if hits.len() < 2 {
            return hits;
        }

        let window = hits.len().min(RERANK_WINDOW);
        let listing: String = hits[..window]
            .iter()
            .enumerate()
            .map(|(i, h)| format!("{i}: {} — {}\n", h.title, h.snippet))
            .collect();
        let messages = [
            ChatMessage::system(
                "You re-order search results by relevance. Respond with only a JSON array \
                 of result indices, most relevant first. No prose.",
            ),
            ChatMessage::user(format!("Query: {query}\n\nResults:\n{listing}")),
        ];
        let options = ChatOptions {
            temperature: 0.0,
            max_tokens: 512,
        };

        let response = match chat.chat_completion(model, &messages, &options).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("rerank call failed, keeping fused order: {e}");
                return hits;
            }
        };

        let Some(order) = parse_rerank_order(&response.content, window) else {
            tracing::warn!("rerank output unparseable, keeping fused order");
            return hits;
        };

        let mut reordered: Vec<SearchHit> = Vec::with_capacity(hits.len());
        let mut used = vec![false; hits.len()];
        for idx in order {
            if !used[idx] {
                used[idx] = true;
                reordered.push(hits[idx].clone());
            }
        }
        for (idx, hit) in hits.iter().enumerate() {
            if !used[idx] {
                reordered.push(hit.clone());
            }
        }
        reordered
    }
}

/// Lowercase, strip non-alphanumerics, drop stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// BM25 score of one document for the query terms present in it.
#[allow(clippy::too_many_arguments)]
fn bm25_score(
    term_freqs: &[(String, u32)],
    dfs: &HashMap<String, u32>,
    n_docs: u64,
    doc_len: u32,
    avg_len: f64,
    k1: f32,
    b: f32,
) -> f32 {
    let avg_len = if avg_len <= 0.0 { 1.0 } else { avg_len } as f32;
    let dl = doc_len as f32;
    term_freqs
        .iter()
        .map(|(term, tf)| {
            let df = dfs.get(term).copied().unwrap_or(1) as f32;
            let n = n_docs.max(1) as f32;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
            let tf = *tf as f32;
            idf * (tf * (k1 + 1.0)) / (tf + k1 * (1.0 - b + b * dl / avg_len))
        })
        .sum()
}

fn snippet_of(content: &str) -> String {
    let snippet: String = content.chars().take(200).collect();
    snippet
}

/// Extract a JSON integer array from model output, keeping only in-window
/// indices, first occurrence wins.
fn parse_rerank_order(output: &str, window: usize) -> Option<Vec<usize>> {
    let start = output.find('[')?;
    let end = output[start..].find(']')? + start;
    let array: Vec<serde_json::Value> = serde_json::from_str(&output[start..=end]).ok()?;
    let mut seen = HashSet::new();
    let order: Vec<usize> = array
        .iter()
        .filter_map(|v| v.as_u64())
        .map(|v| v as usize)
        .filter(|i| *i < window && seen.insert(*i))
        .collect();
    if order.is_empty() {
        None
    } else {
        Some(order)
    }
}
