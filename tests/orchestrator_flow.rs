//! End-to-end orchestrator tests over the public API: tool surface →
//! job engine → pipeline → store, with a scripted chat provider.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

use parallax::config::OrchestratorConfig;
use parallax::embedding::{Embedder, HashEmbeddingService};
use parallax::jobs::broadcast::event_stream;
use parallax::jobs::JobEngine;
use parallax::provider::{ChatClient, ChatMessage, ChatOptions, ChatResponse, StreamDelta};
use parallax::router::catalog::CatalogHandle;
use parallax::router::ModelRouter;
use parallax::types::error::ProviderError;
use parallax::types::{JobId, RequestId, TokenUsage};
use parallax::{
    HybridIndex, Pipeline, ResearchStore, SemanticCache, Services, ToolSurface,
};

const PLAN: &str = "<subquery>How does a consensus protocol elect a leader?</subquery>";
const ANSWER: &str =
    "Leaders are elected by majority vote. [Source: Raft paper — https://raft.github.io] High.";
const REPORT: &str = "# Consensus\nLeaders are elected by majority vote. \
    [Source: Raft paper — https://raft.github.io] Confidence: High.";

/// Keyword-scripted chat client used in place of a remote provider.
struct FakeProvider;

impl FakeProvider {
    fn answer_for(user: &str) -> String {
        if user.contains("Original query") {
            REPORT.to_string()
        } else if user.contains("Query:") {
            PLAN.to_string()
        } else if user.contains("elect a leader") {
            ANSWER.to_string()
        } else {
            "simple".to_string()
        }
    }

    fn user_text(messages: &[ChatMessage]) -> String {
        messages
            .iter()
            .rev()
            .filter_map(|m| {
                m.parts.iter().find_map(|p| match p {
                    parallax::provider::ContentPart::Text { text } => Some(text.clone()),
                    _ => None,
                })
            })
            .next()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatClient for FakeProvider {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<ChatResponse, ProviderError> {
        Ok(ChatResponse {
            content: Self::answer_for(&Self::user_text(messages)),
            usage: TokenUsage {
                prompt_tokens: 15,
                completion_tokens: 25,
                total_tokens: 40,
            },
            model: model.to_string(),
        })
    }

    async fn chat_completion_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<BoxStream<'static, StreamDelta>, ProviderError> {
        let response = self.chat_completion(model, messages, options).await?;
        // Two content chunks then the usage record, like a real SSE stream.
        let midpoint = response.content.len() / 2;
        let split = response
            .content
            .char_indices()
            .map(|(i, _)| i)
            .find(|i| *i >= midpoint)
            .unwrap_or(0);
        let (head, tail) = response.content.split_at(split);
        let deltas = vec![
            StreamDelta {
                content_delta: Some(head.to_string()),
                ..Default::default()
            },
            StreamDelta {
                content_delta: Some(tail.to_string()),
                ..Default::default()
            },
            StreamDelta {
                usage: Some(response.usage),
                ..Default::default()
            },
        ];
        Ok(Box::pin(futures::stream::iter(deltas)))
    }
}

async fn build_surface(dir: &tempfile::TempDir) -> Arc<ToolSurface> {
    let mut config = OrchestratorConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.report_output_path = dir.path().join("reports");
    config.low_cost_models = vec!["fake/alpha".into(), "fake/beta".into()];
    // A deliberately slow poll so cancellation tests land before a worker
    // claims the job.
    config.poll_interval = Duration::from_millis(100);
    config.lease_timeout = Duration::from_millis(900);
    let config = Arc::new(config);

    let embedder = Arc::new(Embedder::with_service(Arc::new(HashEmbeddingService::new(
        256,
    ))));
    let store = Arc::new(ResearchStore::new(config.clone(), embedder.clone()));
    store.install_memory_conn().await;

    let chat: Arc<dyn ChatClient> = Arc::new(FakeProvider);
    let cache = Arc::new(SemanticCache::new(&config));
    let router = Arc::new(ModelRouter::new(&config, Arc::new(CatalogHandle::new(None))));
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

    Arc::new(ToolSurface::new(Arc::new(Services {
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
    })))
}

async fn wait_for_status(surface: &ToolSurface, job_id: &str, expected: &str) -> serde_json::Value {
    for _ in 0..300 {
        let status = surface
            .dispatch(
                "job_status",
                serde_json::json!({ "job_id": job_id, "format": "summary" }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();
        if status["status"] == expected {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never reached status {expected}");
}

#[tokio::test]
async fn sync_research_produces_cited_persisted_report() {
    let dir = tempfile::TempDir::new().unwrap();
    let surface = build_surface(&dir).await;

    let result = surface
        .dispatch(
            "research",
            serde_json::json!({ "query": "how do consensus protocols elect a leader", "async": false }),
            RequestId::new(),
            0,
        )
        .await
        .unwrap();

    let text = result["text"].as_str().unwrap();
    assert!(text.contains("[Source:") || text.contains("[Unverified]"));
    let report_id = result["report_id"].as_i64().unwrap();
    assert!(report_id > 0);

    // The report file artifact exists and matches the delivered text.
    let path = result["file_path"].as_str().unwrap();
    assert!(path.contains(&format!("research-report-{report_id}.md")));
    assert_eq!(std::fs::read_to_string(path).unwrap(), text);

    // Durable row matches too.
    let stored = surface
        .dispatch(
            "get_report",
            serde_json::json!({ "reportId": report_id, "mode": "full" }),
            RequestId::new(),
            0,
        )
        .await
        .unwrap();
    assert_eq!(stored["text"].as_str().unwrap(), text);
}

#[tokio::test]
async fn async_cancellation_leaves_no_report() {
    let dir = tempfile::TempDir::new().unwrap();
    let surface = build_surface(&dir).await;

    let receipt = surface
        .dispatch(
            "submit_research",
            serde_json::json!({ "query": "survey of modern consensus protocols", "cost": "high" }),
            RequestId::new(),
            0,
        )
        .await
        .unwrap();
    let job_id = receipt["job_id"].as_str().unwrap().to_string();

    let canceled = surface
        .dispatch(
            "cancel_job",
            serde_json::json!({ "job_id": job_id }),
            RequestId::new(),
            0,
        )
        .await
        .unwrap();
    assert_eq!(canceled["canceled"], true);

    wait_for_status(&surface, &job_id, "canceled").await;

    // No report row was written for the canceled job.
    let history = surface
        .dispatch(
            "list_research_history",
            serde_json::json!({ "limit": 10, "queryFilter": "consensus" }),
            RequestId::new(),
            0,
        )
        .await
        .unwrap();
    assert_eq!(history["listing"], "No research reports yet.");
}

#[tokio::test]
async fn job_events_resume_from_cursor() {
    let dir = tempfile::TempDir::new().unwrap();
    let surface = build_surface(&dir).await;
    let store = surface.services().store.clone();

    let receipt = surface
        .dispatch(
            "submit_research",
            serde_json::json!({ "query": "how do consensus protocols elect a leader" }),
            RequestId::new(),
            0,
        )
        .await
        .unwrap();
    let job_id = receipt["job_id"].as_str().unwrap().to_string();
    wait_for_status(&surface, &job_id, "succeeded").await;

    // Read three events, note the cursor, then resume.
    use futures::StreamExt;
    let mut stream = event_stream(
        store.clone(),
        JobId(job_id.clone()),
        0,
        Duration::from_millis(20),
    );
    let mut last_id = 0;
    for _ in 0..3 {
        last_id = stream.next().await.expect("at least three events").id;
    }
    drop(stream);

    let rest: Vec<_> = event_stream(
        store,
        JobId(job_id),
        last_id,
        Duration::from_millis(20),
    )
    .collect()
    .await;
    assert!(!rest.is_empty());
    assert!(rest.iter().all(|e| e.id > last_id));
    assert!(rest.windows(2).all(|w| w[0].id < w[1].id));
    assert_eq!(rest.last().unwrap().event_type, "status");
}

#[tokio::test]
async fn hybrid_index_round_trip_through_tools() {
    let dir = tempfile::TempDir::new().unwrap();
    let surface = build_surface(&dir).await;

    surface
        .dispatch(
            "index_texts",
            serde_json::json!({ "docs": [{
                "name": "B-tree variants",
                "content": "A survey covering the copy-on-write B-epsilon tree among others."
            }]}),
            RequestId::new(),
            0,
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
    assert_eq!(hits[0]["title"], "B-tree variants");
    assert!(hits[0]["hybridScore"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn server_status_covers_all_subsystems() {
    let dir = tempfile::TempDir::new().unwrap();
    let surface = build_surface(&dir).await;

    let status = surface
        .dispatch("get_server_status", serde_json::json!({}), RequestId::new(), 0)
        .await
        .unwrap();
    assert_eq!(status["database"]["state"], "initialized");
    assert_eq!(status["embedder"]["dimension"], 256);
    assert!(status["jobs"].is_object());
    assert!(status["convergence"]["status"].is_string());
}
