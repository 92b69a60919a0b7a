//! Two-tier answer cache for research requests.
//!
//! Tier 1 is an exact-parameter LRU with TTL; tier 2 stores query embeddings
//! and answers, matched by cosine similarity with a hard 0.85 floor. Lower
//! thresholds caused cross-topic contamination in practice, so below the floor a lookup
//! is a miss and the request proceeds to fresh research.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::OrchestratorConfig;
use crate::embedding::cosine_similarity;
use crate::types::{ReportId, ResearchParams};

/// Hard similarity floor for the semantic tier.
pub const CACHE_SIMILARITY_FLOOR: f32 = 0.85;

/// A cached answer.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnswer {
    pub answer: String,
    pub report_id: Option<ReportId>,
    /// Cosine similarity for semantic hits; 1.0 for exact hits.
    pub similarity: f32,
}

struct ExactEntry {
    answer: String,
    report_id: Option<ReportId>,
    created: Instant,
}

struct SemanticEntry {
    embedding: Vec<f32>,
    answer: String,
    report_id: Option<ReportId>,
    created: Instant,
}

struct CacheInner {
    exact: HashMap<String, ExactEntry>,
    order: VecDeque<String>,
    semantic: VecDeque<SemanticEntry>,
}

/// Process-wide semantic cache. Guarded so concurrent lookups of the same
/// key never observe a torn entry.
pub struct SemanticCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    capacity: usize,
    similarity_floor: f32,
}

impl SemanticCache {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                exact: HashMap::new(),
                order: VecDeque::new(),
                semantic: VecDeque::new(),
            }),
            ttl: config.cache_ttl,
            capacity: config.cache_capacity.max(1),
            similarity_floor: config.cache_similarity_floor.max(CACHE_SIMILARITY_FLOOR),
        }
    }

    /// Hash of the normalized request parameters plus attachment
    /// fingerprints; the exact-tier key.
    pub fn exact_key(params: &ResearchParams) -> String {
        let mut hasher = Sha256::new();
        hasher.update(params.query.as_bytes());
        hasher.update(
            serde_json::to_vec(&(
                &params.cost_preference,
                &params.audience_level,
                &params.output_format,
                params.include_sources,
            ))
            .unwrap_or_default(),
        );
        for image in &params.images {
            hasher.update(image.name.as_bytes());
            if let Some(ref data) = image.data {
                hasher.update(data.as_bytes());
            }
            if let Some(ref url) = image.url {
                hasher.update(url.as_bytes());
            }
        }
        for doc in &params.text_documents {
            hasher.update(doc.name.as_bytes());
            hasher.update(doc.content.as_bytes());
        }
        for data in &params.structured_data {
            hasher.update(data.name.as_bytes());
            hasher.update(data.data.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Exact-parameter lookup.
    pub fn lookup_exact(&self, params: &ResearchParams) -> Option<CachedAnswer> {
        let key = Self::exact_key(params);
        let mut inner = self.inner.lock();
        let entry = inner.exact.get(&key)?;
        if entry.created.elapsed() > self.ttl {
            inner.exact.remove(&key);
            inner.order.retain(|k| k != &key);
            return None;
        }
        // Refresh LRU position.
        let hit = CachedAnswer {
            answer: entry.answer.clone(),
            report_id: entry.report_id,
            similarity: 1.0,
        };
        inner.order.retain(|k| k != &key);
        inner.order.push_back(key);
        Some(hit)
    }

    /// Semantic lookup by query embedding. Returns the nearest prior entry
    /// at or above the floor, or a miss.
    pub fn lookup_semantic(&self, query_embedding: &[f32]) -> Option<CachedAnswer> {
        let mut inner = self.inner.lock();
        let ttl = self.ttl;
        inner.semantic.retain(|e| e.created.elapsed() <= ttl);

        let mut best: Option<(f32, &SemanticEntry)> = None;
        for entry in &inner.semantic {
            let similarity = cosine_similarity(query_embedding, &entry.embedding);
            if similarity >= self.similarity_floor
                && best.map(|(s, _)| similarity > s).unwrap_or(true)
            {
                best = Some((similarity, entry));
            }
        }
        best.map(|(similarity, entry)| CachedAnswer {
            answer: entry.answer.clone(),
            report_id: entry.report_id,
            similarity,
        })
    }

    /// Store an answer in both tiers (semantic only when an embedding is
    /// available).
    pub fn insert(
        &self,
        params: &ResearchParams,
        query_embedding: Option<Vec<f32>>,
        answer: &str,
        report_id: Option<ReportId>,
    ) {
        let key = Self::exact_key(params);
        let mut inner = self.inner.lock();

        if inner.exact.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        }
        inner.exact.insert(
            key.clone(),
            ExactEntry {
                answer: answer.to_string(),
                report_id,
                created: Instant::now(),
            },
        );
        inner.order.push_back(key);
        while inner.exact.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.exact.remove(&evicted);
            } else {
                break;
            }
        }

        if let Some(embedding) = query_embedding {
            inner.semantic.push_back(SemanticEntry {
                embedding,
                answer: answer.to_string(),
                report_id,
                created: Instant::now(),
            });
            while inner.semantic.len() > self.capacity * 2 {
                inner.semantic.pop_front();
            }
        }
    }

    /// (exact entries, semantic entries) currently held.
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.exact.len(), inner.semantic.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CostTier;

    fn cache() -> SemanticCache {
        SemanticCache::new(&OrchestratorConfig::default())
    }

    fn small_cache(capacity: usize, ttl: Duration) -> SemanticCache {
        let mut config = OrchestratorConfig::default();
        config.cache_capacity = capacity;
        config.cache_ttl = ttl;
        SemanticCache::new(&config)
    }

    #[test]
    fn exact_hit_requires_identical_parameters() {
        let cache = cache();
        let params = ResearchParams::new("what is BM25");
        cache.insert(&params, None, "BM25 is…", Some(1));

        let hit = cache.lookup_exact(&params).unwrap();
        assert_eq!(hit.answer, "BM25 is…");
        assert_eq!(hit.report_id, Some(1));
        assert_eq!(hit.similarity, 1.0);

        let mut other = params.clone();
        other.cost_preference = CostTier::High;
        assert!(cache.lookup_exact(&other).is_none());
    }

    #[test]
    fn exact_entries_expire() {
        let cache = small_cache(10, Duration::from_millis(0));
        let params = ResearchParams::new("q");
        cache.insert(&params, None, "a", None);
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.lookup_exact(&params).is_none());
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache = small_cache(2, Duration::from_secs(60));
        let p1 = ResearchParams::new("one");
        let p2 = ResearchParams::new("two");
        let p3 = ResearchParams::new("three");
        cache.insert(&p1, None, "1", None);
        cache.insert(&p2, None, "2", None);
        // Touch p1 so p2 becomes the eviction candidate.
        cache.lookup_exact(&p1).unwrap();
        cache.insert(&p3, None, "3", None);

        assert!(cache.lookup_exact(&p1).is_some());
        assert!(cache.lookup_exact(&p2).is_none());
        assert!(cache.lookup_exact(&p3).is_some());
    }

    #[test]
    fn semantic_hit_at_or_above_floor() {
        let cache = cache();
        let params = ResearchParams::new("q");
        let stored = vec![1.0, 0.0, 0.0];
        cache.insert(&params, Some(stored.clone()), "answer", Some(2));

        // Identical embedding: similarity 1.0.
        let hit = cache.lookup_semantic(&stored).unwrap();
        assert_eq!(hit.report_id, Some(2));
        assert!(hit.similarity >= CACHE_SIMILARITY_FLOOR);

        // Nearly parallel vector still hits (cos ≈ 0.995).
        let close = vec![1.0, 0.1, 0.0];
        assert!(cache.lookup_semantic(&close).is_some());
    }

    #[test]
    fn semantic_miss_below_floor() {
        let cache = cache();
        let params = ResearchParams::new("q");
        cache.insert(&params, Some(vec![1.0, 0.0, 0.0]), "answer", None);

        // cos = 0.6 < 0.85 floor → miss, never a cross-topic hit.
        let off_topic = vec![0.6, 0.8, 0.0];
        assert!(cache.lookup_semantic(&off_topic).is_none());
    }

    #[test]
    fn semantic_lookup_picks_nearest() {
        let cache = cache();
        cache.insert(
            &ResearchParams::new("a"),
            Some(vec![1.0, 0.0]),
            "answer-a",
            None,
        );
        cache.insert(
            &ResearchParams::new("b"),
            Some(vec![0.95, 0.31225]),
            "answer-b",
            None,
        );

        let hit = cache.lookup_semantic(&[1.0, 0.0]).unwrap();
        assert_eq!(hit.answer, "answer-a");
    }

    #[test]
    fn attachments_change_the_exact_key() {
        let base = ResearchParams::new("q");
        let mut with_doc = base.clone();
        with_doc.text_documents.push(crate::types::TextDocument {
            name: "notes.txt".into(),
            content: "content".into(),
        });
        assert_ne!(
            SemanticCache::exact_key(&base),
            SemanticCache::exact_key(&with_doc)
        );
    }
}
