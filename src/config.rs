//! Environment-driven configuration for the orchestrator.
//!
//! Every knob has a default that works for a fresh install; `from_env`
//! overlays `PARALLAX_*` variables on top of those defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the whole orchestrator, resolved once at startup and
/// passed down through the services record.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory holding the SQLite database and report artifacts.
    pub data_dir: PathBuf,
    /// Use an ephemeral in-memory store when the file-backed one fails to open.
    pub allow_in_memory_fallback: bool,
    /// Relax SQLite durability (`synchronous = NORMAL`) for throughput.
    pub relaxed_durability: bool,
    /// Embedding vector dimension D.
    pub vector_dimension: usize,
    /// Store retry policy.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Timeout for operations waiting on store initialization.
    pub init_wait_timeout: Duration,

    /// Job engine.
    pub lease_timeout: Duration,
    pub worker_count: usize,
    pub poll_interval: Duration,
    /// Queue depth beyond which `submit` returns `Overloaded`.
    pub max_queued_jobs: usize,
    /// TTL for idempotency keys on submission.
    pub idempotency_ttl: Duration,

    /// Research execution.
    pub parallelism: usize,
    pub ensemble_size: usize,
    pub max_iterations: u32,
    pub max_tool_depth: u8,
    /// Enable the optional post-synthesis fact-check annotation pass.
    pub fact_check_enabled: bool,

    /// Similarity floors. Context floor gates planning-context reports,
    /// cache floor gates semantic-cache hits. Both are hard minimums.
    pub context_similarity_floor: f32,
    pub cache_similarity_floor: f32,

    /// Semantic cache.
    pub cache_ttl: Duration,
    pub cache_capacity: usize,

    /// Model routing.
    pub very_low_cost_models: Vec<String>,
    pub low_cost_models: Vec<String>,
    pub high_cost_models: Vec<String>,
    pub catalog_url: Option<String>,
    pub catalog_refresh: Duration,

    /// Hybrid index.
    pub indexer_enabled: bool,
    pub index_weight_bm25: f32,
    pub index_weight_vector: f32,
    pub bm25_k1: f32,
    pub bm25_b: f32,
    pub index_max_content_len: usize,
    pub rerank_enabled: bool,
    pub rerank_model: Option<String>,

    /// Report artifacts.
    pub report_output_path: PathBuf,

    /// Optional JSON search endpoint for `search_web`.
    pub search_endpoint: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parallax");
        let report_output_path = data_dir.join("reports");
        Self {
            data_dir,
            allow_in_memory_fallback: false,
            relaxed_durability: false,
            vector_dimension: 384,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            init_wait_timeout: Duration::from_secs(10),
            lease_timeout: Duration::from_secs(60),
            worker_count: 1,
            poll_interval: Duration::from_millis(500),
            max_queued_jobs: 64,
            idempotency_ttl: Duration::from_secs(24 * 3600),
            parallelism: 4,
            ensemble_size: 2,
            max_iterations: 2,
            max_tool_depth: 3,
            fact_check_enabled: false,
            context_similarity_floor: 0.80,
            cache_similarity_floor: 0.85,
            cache_ttl: Duration::from_secs(3600),
            cache_capacity: 100,
            very_low_cost_models: Vec::new(),
            low_cost_models: vec![
                "openai/gpt-4o-mini".to_string(),
                "anthropic/claude-3-5-haiku".to_string(),
                "google/gemini-2.0-flash-001".to_string(),
            ],
            high_cost_models: vec![
                "anthropic/claude-sonnet-4".to_string(),
                "openai/gpt-4o".to_string(),
                "google/gemini-2.5-pro".to_string(),
            ],
            catalog_url: None,
            catalog_refresh: Duration::from_secs(3600),
            indexer_enabled: true,
            index_weight_bm25: 0.5,
            index_weight_vector: 0.5,
            bm25_k1: 1.2,
            bm25_b: 0.75,
            index_max_content_len: 8_000,
            rerank_enabled: false,
            rerank_model: None,
            report_output_path,
            search_endpoint: None,
        }
    }
}

impl OrchestratorConfig {
    /// Resolve configuration from the environment on top of defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(dir) = env_string("PARALLAX_DATA_DIR") {
            cfg.data_dir = PathBuf::from(&dir);
            cfg.report_output_path = cfg.data_dir.join("reports");
        }
        if let Some(path) = env_string("PARALLAX_REPORT_OUTPUT_PATH") {
            cfg.report_output_path = PathBuf::from(path);
        }
        if let Some(v) = env_bool("PARALLAX_ALLOW_IN_MEMORY_FALLBACK") {
            cfg.allow_in_memory_fallback = v;
        }
        if let Some(v) = env_bool("PARALLAX_RELAXED_DURABILITY") {
            cfg.relaxed_durability = v;
        }
        if let Some(v) = env_parse::<usize>("PARALLAX_VECTOR_DIM") {
            cfg.vector_dimension = v;
        }
        if let Some(v) = env_parse::<u32>("PARALLAX_MAX_RETRIES") {
            cfg.max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("PARALLAX_RETRY_BASE_DELAY_MS") {
            cfg.retry_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("PARALLAX_LEASE_TIMEOUT_SECS") {
            cfg.lease_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("PARALLAX_WORKERS") {
            cfg.worker_count = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("PARALLAX_MAX_QUEUED_JOBS") {
            cfg.max_queued_jobs = v;
        }
        if let Some(v) = env_parse::<usize>("PARALLAX_PARALLELISM") {
            cfg.parallelism = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("PARALLAX_ENSEMBLE_SIZE") {
            // Ensembles are clamped to [2, 3] regardless of what is asked for.
            cfg.ensemble_size = v.clamp(2, 3);
        }
        if let Some(v) = env_parse::<u32>("PARALLAX_MAX_ITERATIONS") {
            cfg.max_iterations = v.max(1);
        }
        if let Some(v) = env_bool("PARALLAX_FACT_CHECK") {
            cfg.fact_check_enabled = v;
        }
        if let Some(v) = env_parse::<f32>("PARALLAX_CONTEXT_SIMILARITY_FLOOR") {
            cfg.context_similarity_floor = v.max(0.80);
        }
        if let Some(v) = env_parse::<f32>("PARALLAX_CACHE_SIMILARITY_FLOOR") {
            cfg.cache_similarity_floor = v.max(0.85);
        }
        if let Some(v) = env_parse::<u64>("PARALLAX_CACHE_TTL_SECS") {
            cfg.cache_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("PARALLAX_CACHE_CAPACITY") {
            cfg.cache_capacity = v;
        }
        if let Some(v) = env_list("PARALLAX_VERY_LOW_COST_MODELS") {
            cfg.very_low_cost_models = v;
        }
        if let Some(v) = env_list("PARALLAX_LOW_COST_MODELS") {
            cfg.low_cost_models = v;
        }
        if let Some(v) = env_list("PARALLAX_HIGH_COST_MODELS") {
            cfg.high_cost_models = v;
        }
        cfg.catalog_url = env_string("PARALLAX_MODEL_CATALOG_URL");
        if let Some(v) = env_parse::<u64>("PARALLAX_CATALOG_REFRESH_SECS") {
            cfg.catalog_refresh = Duration::from_secs(v);
        }
        if let Some(v) = env_bool("PARALLAX_INDEXER_ENABLED") {
            cfg.indexer_enabled = v;
        }
        if let Some(v) = env_parse::<f32>("PARALLAX_INDEX_WEIGHT_BM25") {
            cfg.index_weight_bm25 = v;
        }
        if let Some(v) = env_parse::<f32>("PARALLAX_INDEX_WEIGHT_VECTOR") {
            cfg.index_weight_vector = v;
        }
        if let Some(v) = env_parse::<f32>("PARALLAX_BM25_K1") {
            cfg.bm25_k1 = v;
        }
        if let Some(v) = env_parse::<f32>("PARALLAX_BM25_B") {
            cfg.bm25_b = v;
        }
        if let Some(v) = env_parse::<usize>("PARALLAX_INDEX_MAX_CONTENT_LEN") {
            cfg.index_max_content_len = v;
        }
        if let Some(v) = env_bool("PARALLAX_RERANK_ENABLED") {
            cfg.rerank_enabled = v;
        }
        cfg.rerank_model = env_string("PARALLAX_RERANK_MODEL");
        cfg.search_endpoint = env_string("PARALLAX_SEARCH_ENDPOINT");

        cfg
    }

    /// Heartbeat interval derived from the lease timeout.
    pub fn heartbeat_interval(&self) -> Duration {
        self.lease_timeout / 3
    }

    /// Path of the primary SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("parallax.db")
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.parse::<T>().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env_string(name).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env_string(name).map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        let keys: Vec<String> = std::env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with("PARALLAX_"))
            .collect();
        for key in keys {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_match_reference_values() {
        clear_env();
        let cfg = OrchestratorConfig::from_env();
        assert_eq!(cfg.vector_dimension, 384);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_base_delay, Duration::from_millis(100));
        assert_eq!(cfg.parallelism, 4);
        assert_eq!(cfg.context_similarity_floor, 0.80);
        assert_eq!(cfg.cache_similarity_floor, 0.85);
        assert_eq!(cfg.bm25_k1, 1.2);
        assert_eq!(cfg.bm25_b, 0.75);
        assert_eq!(cfg.index_max_content_len, 8_000);
        assert_eq!(cfg.max_tool_depth, 3);
    }

    #[test]
    #[serial]
    fn ensemble_size_is_clamped() {
        clear_env();
        std::env::set_var("PARALLAX_ENSEMBLE_SIZE", "7");
        let cfg = OrchestratorConfig::from_env();
        assert_eq!(cfg.ensemble_size, 3);

        std::env::set_var("PARALLAX_ENSEMBLE_SIZE", "1");
        let cfg = OrchestratorConfig::from_env();
        assert_eq!(cfg.ensemble_size, 2);
        clear_env();
    }

    #[test]
    #[serial]
    fn similarity_floors_never_go_below_reference() {
        clear_env();
        std::env::set_var("PARALLAX_CONTEXT_SIMILARITY_FLOOR", "0.70");
        std::env::set_var("PARALLAX_CACHE_SIMILARITY_FLOOR", "0.5");
        let cfg = OrchestratorConfig::from_env();
        assert_eq!(cfg.context_similarity_floor, 0.80);
        assert_eq!(cfg.cache_similarity_floor, 0.85);
        clear_env();
    }

    #[test]
    #[serial]
    fn model_tier_lists_parse_from_csv() {
        clear_env();
        std::env::set_var("PARALLAX_VERY_LOW_COST_MODELS", "a/one, b/two ,");
        let cfg = OrchestratorConfig::from_env();
        assert_eq!(cfg.very_low_cost_models, vec!["a/one", "b/two"]);
        clear_env();
    }

    #[test]
    fn heartbeat_is_a_third_of_lease() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.heartbeat_interval(), cfg.lease_timeout / 3);
    }
}
