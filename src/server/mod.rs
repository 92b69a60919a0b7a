//! Service wiring and transports.
//!
//! Every component is constructed once at startup into an explicit
//! [`Services`] record and passed down; no module-level singletons, no
//! init order hidden in import side-effects.

pub mod http;
pub mod stdio;

use std::sync::Arc;

use crate::cache::SemanticCache;
use crate::config::OrchestratorConfig;
use crate::embedding::Embedder;
use crate::index::HybridIndex;
use crate::jobs::JobEngine;
use crate::pipeline::Pipeline;
use crate::provider::{ChatClient, HttpChatClient};
use crate::router::catalog::CatalogHandle;
use crate::router::ModelRouter;
use crate::store::ResearchStore;
use crate::types::error::OrchestratorError;

/// Everything a request handler needs, built once at startup.
pub struct Services {
    pub config: Arc<OrchestratorConfig>,
    pub store: Arc<ResearchStore>,
    pub embedder: Arc<Embedder>,
    pub cache: Arc<SemanticCache>,
    pub router: Arc<ModelRouter>,
    pub chat: Option<Arc<dyn ChatClient>>,
    pub hybrid: Arc<HybridIndex>,
    pub pipeline: Option<Arc<Pipeline>>,
    pub jobs: Option<Arc<JobEngine>>,
    pub http: reqwest::Client,
}

impl Services {
    /// Build the full service graph from configuration, initialize the
    /// store, and start background work (catalog refresh, job workers,
    /// vector reindex when the embedder changed).
    pub async fn build(config: OrchestratorConfig) -> Result<Arc<Self>, OrchestratorError> {
        let config = Arc::new(config);
        let embedder = Arc::new(Embedder::new(config.vector_dimension));
        let store = Arc::new(ResearchStore::new(config.clone(), embedder.clone()));
        store.initialize().await?;

        // A changed embedder invalidates stored vectors; reindex off the
        // request path.
        if store.record_embedder_version().await.unwrap_or(false) {
            let store_for_reindex = store.clone();
            tokio::spawn(async move {
                let reports = store_for_reindex.reindex_report_vectors().await;
                let docs = store_for_reindex.reindex_document_vectors().await;
                tracing::info!(?reports, ?docs, "vector reindex after embedder change");
            });
        }

        let catalog = Arc::new(CatalogHandle::new(config.catalog_url.clone()));
        if config.catalog_url.is_some() {
            let catalog_refresh = catalog.clone();
            let period = config.catalog_refresh;
            tokio::spawn(async move {
                loop {
                    if let Err(e) = catalog_refresh.refresh().await {
                        tracing::warn!("catalog refresh failed: {e}");
                    }
                    tokio::time::sleep(period).await;
                }
            });
        }
        let router = Arc::new(ModelRouter::new(&config, catalog));

        let chat: Option<Arc<dyn ChatClient>> =
            HttpChatClient::from_env().map(|c| Arc::new(c) as Arc<dyn ChatClient>);
        let cache = Arc::new(SemanticCache::new(&config));
        let hybrid = Arc::new(HybridIndex::new(store.clone(), chat.clone(), &config));

        let (pipeline, jobs) = match &chat {
            Some(chat) => {
                let pipeline = Arc::new(Pipeline::new(
                    store.clone(),
                    embedder.clone(),
                    cache.clone(),
                    router.clone(),
                    chat.clone(),
                    hybrid.clone(),
                    config.clone(),
                ));
                let jobs = Arc::new(JobEngine::new(
                    store.clone(),
                    pipeline.clone(),
                    config.clone(),
                ));
                jobs.start_workers();
                (Some(pipeline), Some(jobs))
            }
            None => {
                tracing::warn!(
                    "no chat provider configured; research tools are disabled, retrieval \
                     tools remain available"
                );
                (None, None)
            }
        };

        Ok(Arc::new(Self {
            config,
            store,
            embedder,
            cache,
            router,
            chat,
            hybrid,
            pipeline,
            jobs,
            http: reqwest::Client::new(),
        }))
    }

    /// The pipeline, or a provider error when no chat backend is configured.
    pub fn pipeline(&self) -> Result<&Arc<Pipeline>, OrchestratorError> {
        self.pipeline.as_ref().ok_or_else(no_provider)
    }

    /// The job engine, or a provider error when no chat backend is
    /// configured.
    pub fn jobs(&self) -> Result<&Arc<JobEngine>, OrchestratorError> {
        self.jobs.as_ref().ok_or_else(no_provider)
    }
}

fn no_provider() -> OrchestratorError {
    OrchestratorError::Provider(crate::types::error::ProviderError::permanent(
        "no chat provider configured (set OPENROUTER_API_KEY or OPENAI_API_KEY)",
    ))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::pipeline::testing::ScriptedChat;
    use crate::store::testutil::memory_store;

    /// Services over an in-memory store and a scripted chat client.
    pub async fn scripted_services(
        responses: Vec<(&'static str, &'static str)>,
        dir: &tempfile::TempDir,
    ) -> Arc<Services> {
        let mut config = OrchestratorConfig::default();
        config.report_output_path = dir.path().join("reports");
        config.low_cost_models = vec!["t/one".into(), "t/two".into()];
        config.poll_interval = std::time::Duration::from_millis(20);
        let config = Arc::new(config);

        let store = memory_store().await;
        let embedder = store.embedder().clone();
        let cache = Arc::new(SemanticCache::new(&config));
        let catalog = Arc::new(CatalogHandle::new(None));
        let router = Arc::new(ModelRouter::new(&config, catalog));
        let chat: Arc<dyn ChatClient> = Arc::new(ScriptedChat::new(responses));
        let hybrid = Arc::new(HybridIndex::new(store.clone(), Some(chat.clone()), &config));
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            embedder.clone(),
            cache.clone(),
            router.clone(),
            chat.clone(),
            hybrid.clone(),
            config.clone(),
        ));
        let jobs = Arc::new(JobEngine::new(
            store.clone(),
            pipeline.clone(),
            config.clone(),
        ));
        jobs.start_workers();

        Arc::new(Services {
            config,
            store,
            embedder,
            cache,
            router,
            chat: Some(chat),
            hybrid,
            pipeline: Some(pipeline),
            jobs: Some(jobs),
            http: reqwest::Client::new(),
        })
    }
}
