//! Async job engine: durable submission, worker loop, lease heartbeats,
//! and cooperative cancellation.
//!
//! Workers claim jobs through the store's atomic claim, run the pipeline
//! with the job's event channel draining into the event log, and heartbeat
//! at a third of the lease. A crashed worker's job is re-queued by the
//! stale-lease sweep on the next claim.

pub mod broadcast;

use std::sync::Arc;
use tokio::sync::watch;

use crate::config::OrchestratorConfig;
use crate::events::ResearchEvent;
use crate::pipeline::Pipeline;
use crate::store::jobs::JobRecord;
use crate::store::ResearchStore;
use crate::types::error::OrchestratorError;
use crate::types::{CancelToken, JobId, JobStatus, RequestId, ResearchParams};

/// Receipt returned by `submit`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    /// `true` when an idempotency key matched a prior submission.
    pub duplicate: bool,
    pub sse_url: String,
    pub ui_url: Option<String>,
}

/// The job engine.
pub struct JobEngine {
    store: Arc<ResearchStore>,
    pipeline: Arc<Pipeline>,
    config: Arc<OrchestratorConfig>,
    shutdown_tx: watch::Sender<bool>,
    workers: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl JobEngine {
    pub fn new(
        store: Arc<ResearchStore>,
        pipeline: Arc<Pipeline>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            pipeline,
            config,
            shutdown_tx,
            workers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a job. Applies the backpressure bound, then inserts the row
    /// and appends the `submitted` event. The returned URLs are
    /// informational; the engine does not serve them.
    pub async fn submit(
        &self,
        tool: &str,
        params: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<SubmitReceipt, OrchestratorError> {
        let queued = self.store.queued_job_count().await?;
        if queued >= self.config.max_queued_jobs as u64 {
            return Err(OrchestratorError::Overloaded {
                reason: format!("{queued} jobs already queued"),
            });
        }

        let created = self.store.create_job(tool, params, idempotency_key).await?;
        let duplicate = !created.is_created();
        let job_id = created.job_id().clone();

        if !duplicate {
            self.store
                .append_job_event(
                    &job_id,
                    &ResearchEvent::Submitted {
                        tool: tool.to_string(),
                    },
                )
                .await?;
            tracing::info!(job_id = %job_id, tool, "job submitted");
        }

        Ok(SubmitReceipt {
            sse_url: format!("/jobs/{job_id}/events"),
            ui_url: None,
            job_id,
            duplicate,
        })
    }

    /// Spawn the configured number of workers.
    pub fn start_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        for index in 0..self.config.worker_count {
            let engine = self.clone();
            workers.push(tokio::spawn(async move {
                engine.worker_loop(index).await;
            }));
        }
    }

    /// Signal workers to stop after their current job.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn worker_loop(self: Arc<Self>, index: usize) {
        tracing::info!(worker = index, "job worker started");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match self.store.claim_next_job(self.config.lease_timeout).await {
                Ok(Some(job)) => {
                    let job_id = job.job_id.clone();
                    tracing::info!(worker = index, job_id = %job_id, "job claimed");
                    self.run_job(job).await;
                }
                Ok(None) => {
                    let sleep = jittered(self.config.poll_interval);
                    tokio::select! {
                        _ = tokio::time::sleep(sleep) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(worker = index, "claim failed: {e}");
                    tokio::time::sleep(jittered(self.config.poll_interval)).await;
                }
            }
        }
        tracing::info!(worker = index, "job worker stopped");
    }

    async fn run_job(&self, job: JobRecord) {
        let job_id = job.job_id.clone();
        let cancel = CancelToken::new();

        // Heartbeat at a third of the lease; the write also reads back the
        // canceled flag so cancellation is observed within one interval.
        let heartbeat = {
            let store = self.store.clone();
            let cancel = cancel.clone();
            let job_id = job_id.clone();
            let interval = self.config.heartbeat_interval();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    match store.heartbeat_job(&job_id).await {
                        Ok(true) => {
                            tracing::info!(job_id = %job_id, "cancellation observed");
                            cancel.cancel();
                        }
                        Ok(false) => {}
                        Err(e) => tracing::warn!(job_id = %job_id, "heartbeat failed: {e}"),
                    }
                }
            })
        };

        // Event channel: one producer (the pipeline), drained into the
        // durable event log.
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let writer = {
            let store = self.store.clone();
            let job_id = job_id.clone();
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    if let Err(e) = store.append_job_event(&job_id, &event).await {
                        tracing::warn!(job_id = %job_id, "event append failed: {e}");
                    }
                }
            })
        };

        let result = self.execute(&job, events_tx, cancel.clone()).await;

        heartbeat.abort();
        // Let the writer drain the already-queued events.
        let _ = writer.await;

        let terminal = match result {
            Ok(payload) => {
                if cancel.is_canceled() {
                    (JobStatus::Canceled, None, None)
                } else {
                    (JobStatus::Succeeded, Some(payload), None)
                }
            }
            Err(OrchestratorError::Canceled { .. }) => (JobStatus::Canceled, None, None),
            Err(e) => (
                JobStatus::Failed,
                Some(serde_json::json!({ "error": e.to_wire() })),
                Some(e.to_string()),
            ),
        };

        let (status, payload, error) = terminal;
        if let Err(e) = self
            .store
            .set_job_status(&job_id, status, payload, true)
            .await
        {
            tracing::error!(job_id = %job_id, "terminal status write failed: {e}");
        }
        let _ = self
            .store
            .append_job_event(
                &job_id,
                &ResearchEvent::Status {
                    status,
                    message: error,
                },
            )
            .await;
        tracing::info!(job_id = %job_id, status = status.as_str(), "job finished");
    }

    async fn execute(
        &self,
        job: &JobRecord,
        events: crate::events::EventSender,
        cancel: CancelToken,
    ) -> Result<serde_json::Value, OrchestratorError> {
        match job.job_type.as_str() {
            "research" | "submit_research" => {
                let params: ResearchParams = serde_json::from_value(job.params.clone())
                    .map_err(|e| {
                        OrchestratorError::Validation(
                            crate::types::error::ValidationError::InvalidValue {
                                field: "params".to_string(),
                                reason: e.to_string(),
                            },
                        )
                    })?;
                let outcome = self
                    .pipeline
                    .run_research(params, RequestId::new(), events, cancel)
                    .await?;
                Ok(serde_json::json!({
                    "report_id": outcome.report_id,
                    "file_path": outcome.file_path.as_ref().map(|p| p.display().to_string()),
                    "from_cache": outcome.from_cache,
                    "text": outcome.text,
                    "warnings": outcome.warnings,
                }))
            }
            other => Err(OrchestratorError::Validation(
                crate::types::error::ValidationError::UnknownTool {
                    name: other.to_string(),
                },
            )),
        }
    }
}

fn jittered(base: std::time::Duration) -> std::time::Duration {
    use rand::Rng;
    let jitter = rand::thread_rng().gen_range(0..base.as_millis().max(1) as u64 / 2 + 1);
    base + std::time::Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SemanticCache;
    use crate::index::HybridIndex;
    use crate::pipeline::testing::ScriptedChat;
    use crate::router::catalog::CatalogHandle;
    use crate::router::ModelRouter;
    use crate::store::testutil::memory_store;
    use std::time::Duration;

    const PLAN_ANSWER: &str = "<subquery>What is raft?</subquery>";
    const SYNTH_ANSWER: &str =
        "# Report\nRaft elects a leader. [Source: Paper — https://raft.github.io] High.";

    async fn test_engine(
        chat: Arc<ScriptedChat>,
    ) -> (Arc<JobEngine>, Arc<ResearchStore>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = OrchestratorConfig::default();
        config.report_output_path = dir.path().join("reports");
        config.low_cost_models = vec!["t/one".into(), "t/two".into()];
        config.lease_timeout = Duration::from_millis(300);
        config.poll_interval = Duration::from_millis(20);
        config.worker_count = 1;
        let config = Arc::new(config);

        let store = memory_store().await;
        let embedder = store.embedder().clone();
        let cache = Arc::new(SemanticCache::new(&config));
        let router = Arc::new(ModelRouter::new(&config, Arc::new(CatalogHandle::new(None))));
        let hybrid = Arc::new(HybridIndex::new(store.clone(), None, &config));
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            embedder,
            cache,
            router,
            chat,
            hybrid,
            config.clone(),
        ));
        (
            Arc::new(JobEngine::new(store.clone(), pipeline, config)),
            store,
            dir,
        )
    }

    fn scripted() -> Arc<ScriptedChat> {
        Arc::new(ScriptedChat::new(vec![
            ("Query:", PLAN_ANSWER),
            ("What is raft", SYNTH_ANSWER),
            ("Original query", SYNTH_ANSWER),
        ]))
    }

    async fn wait_for_terminal(store: &ResearchStore, job_id: &JobId) -> JobRecord {
        for _ in 0..200 {
            let job = store.get_job(job_id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job never reached a terminal status");
    }

    #[tokio::test]
    async fn submitted_job_runs_to_success() {
        let (engine, store, _dir) = test_engine(scripted()).await;
        engine.start_workers();

        let receipt = engine
            .submit(
                "research",
                serde_json::json!({ "query": "what is raft consensus" }),
                None,
            )
            .await
            .unwrap();
        assert!(!receipt.duplicate);
        assert!(receipt.sse_url.contains(receipt.job_id.as_str()));

        let job = wait_for_terminal(&store, &receipt.job_id).await;
        assert_eq!(job.status, JobStatus::Succeeded);
        let result = job.result.unwrap();
        assert!(result["report_id"].as_i64().unwrap() > 0);
        assert!(result["text"].as_str().unwrap().contains("[Source:"));

        // Round-trip law: stored params deep-equal the normalized input.
        assert_eq!(job.params["query"], "what is raft consensus");

        // Event log carries the submitted and terminal events in order.
        let events = store.get_job_events(&receipt.job_id, 0, 100).await.unwrap();
        assert_eq!(events.first().unwrap().event_type, "submitted");
        assert_eq!(events.last().unwrap().event_type, "status");
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));

        engine.shutdown();
    }

    #[tokio::test]
    async fn cancellation_reaches_terminal_state() {
        let (engine, store, _dir) = test_engine(scripted()).await;

        let receipt = engine
            .submit(
                "research",
                serde_json::json!({ "query": "survey of modern consensus protocols" }),
                None,
            )
            .await
            .unwrap();
        // Cancel before any worker starts.
        assert!(store.cancel_job(&receipt.job_id).await.unwrap());
        engine.start_workers();

        let job = wait_for_terminal(&store, &receipt.job_id).await;
        assert_eq!(job.status, JobStatus::Canceled);
        assert!(job.canceled);
        // No report row was written.
        assert_eq!(store.report_count().await.unwrap(), 0);

        engine.shutdown();
    }

    #[tokio::test]
    async fn invalid_params_fail_the_job() {
        let (engine, store, _dir) = test_engine(scripted()).await;
        engine.start_workers();

        let receipt = engine
            .submit("research", serde_json::json!({ "query": 42 }), None)
            .await
            .unwrap();
        let job = wait_for_terminal(&store, &receipt.job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        let error = &job.result.unwrap()["error"];
        assert_eq!(error["category"], "validation");

        engine.shutdown();
    }

    #[tokio::test]
    async fn submission_backpressure() {
        let (engine, _store, _dir) = test_engine(scripted()).await;
        // Fill the queue without workers running.
        for i in 0..64 {
            engine
                .submit("research", serde_json::json!({ "query": format!("q{i}") }), None)
                .await
                .unwrap();
        }
        let err = engine
            .submit("research", serde_json::json!({ "query": "one too many" }), None)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "overloaded");
    }

    #[tokio::test]
    async fn duplicate_submission_shares_the_event_log() {
        let (engine, store, _dir) = test_engine(scripted()).await;
        let first = engine
            .submit("research", serde_json::json!({ "query": "q" }), Some("idem".into()))
            .await
            .unwrap();
        let second = engine
            .submit("research", serde_json::json!({ "query": "q" }), Some("idem".into()))
            .await
            .unwrap();
        assert!(second.duplicate);
        assert_eq!(first.job_id, second.job_id);

        // Only one submitted event.
        let events = store.get_job_events(&first.job_id, 0, 10).await.unwrap();
        assert_eq!(
            events
                .iter()
                .filter(|e| e.event_type == "submitted")
                .count(),
            1
        );
    }
}
