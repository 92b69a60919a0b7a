//! Research pipeline supervisor.
//!
//! Drives cache check → prior-report retrieval → plan/research iterations →
//! streaming synthesis → persistence, forwarding every life-cycle event to
//! the request's event channel. Synthesis failure is fatal (nothing is
//! persisted); persistence failure is not (the text still reaches the
//! client with a warning and `report_id = null`).

pub mod planning;
pub mod research;
pub mod synthesis;
pub mod tokens;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::cache::SemanticCache;
use crate::config::OrchestratorConfig;
use crate::embedding::Embedder;
use crate::events::{emit, EventSender, ResearchEvent};
use crate::index::HybridIndex;
use crate::provider::{ChatClient, ChatMessage, ChatOptions};
use crate::router::ModelRouter;
use crate::store::reports::NewReport;
use crate::store::ResearchStore;
use crate::types::error::{OrchestratorError, PlanningError, ValidationError};
use crate::types::{
    CancelToken, ReportId, RequestId, ResearchMetadata, ResearchParams, TokenUsage,
};
use planning::{PlanArtifact, PlanningStage, SubQuery};
use research::{max_iterations_for, ResearchStage, SubQueryResult};
use synthesis::SynthesisStage;

/// Result of a research request.
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub text: String,
    pub report_id: Option<ReportId>,
    pub file_path: Option<PathBuf>,
    pub from_cache: bool,
    pub usage: TokenUsage,
    pub warnings: Vec<String>,
}

/// The request supervisor.
pub struct Pipeline {
    store: Arc<ResearchStore>,
    embedder: Arc<Embedder>,
    cache: Arc<SemanticCache>,
    chat: Arc<dyn ChatClient>,
    hybrid: Arc<HybridIndex>,
    config: Arc<OrchestratorConfig>,
    planning: PlanningStage,
    research: ResearchStage,
    synthesis: SynthesisStage,
}

impl Pipeline {
    pub fn new(
        store: Arc<ResearchStore>,
        embedder: Arc<Embedder>,
        cache: Arc<SemanticCache>,
        router: Arc<ModelRouter>,
        chat: Arc<dyn ChatClient>,
        hybrid: Arc<HybridIndex>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            planning: PlanningStage::new(chat.clone(), router.clone()),
            research: ResearchStage::new(chat.clone(), router.clone(), config.parallelism),
            synthesis: SynthesisStage::new(chat.clone(), router),
            store,
            embedder,
            cache,
            chat,
            hybrid,
            config,
        }
    }

    /// Run one research request end to end.
    pub async fn run_research(
        &self,
        params: ResearchParams,
        request_id: RequestId,
        events: EventSender,
        cancel: CancelToken,
    ) -> Result<ResearchOutcome, OrchestratorError> {
        if params.query.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "query".to_string(),
            }
            .into());
        }
        let started = Instant::now();

        // Tier 1: exact-parameter cache.
        if let Some(hit) = self.cache.lookup_exact(&params) {
            emit(
                &events,
                ResearchEvent::UiHint {
                    message: "served from exact cache".to_string(),
                },
            );
            return Ok(cached_outcome(hit.answer, hit.report_id));
        }

        // Tier 2: semantic cache, gated by the 0.85 floor.
        let query_embedding = self.embedder.embed(&params.query).await;
        if let Some(ref embedding) = query_embedding {
            if let Some(hit) = self.cache.lookup_semantic(embedding) {
                emit(
                    &events,
                    ResearchEvent::UiHint {
                        message: format!(
                            "served from semantic cache (similarity {:.3})",
                            hit.similarity
                        ),
                    },
                );
                return Ok(cached_outcome(hit.answer, hit.report_id));
            }
        }

        // Prior related reports for planning context (floor 0.80, up to 3).
        let prior = self
            .store
            .find_by_similarity(&params.query, 3, self.config.context_similarity_floor)
            .await
            .unwrap_or_default();
        let based_on: Vec<ReportId> = prior.iter().map(|p| p.report.id).collect();
        let past_summaries: Vec<String> = prior
            .iter()
            .map(|p| {
                let excerpt: String = p.report.final_report.chars().take(300).collect();
                format!("(report {}) {}: {excerpt}", p.report.id, p.report.query)
            })
            .collect();

        let mut usage = TokenUsage::default();
        let complexity = self
            .research
            .assess_complexity(&params.query, &params)
            .await;
        let max_iterations = max_iterations_for(complexity, self.config.max_iterations);
        tracing::debug!(
            request_id = %request_id,
            ?complexity,
            max_iterations,
            "research request assessed"
        );

        let mut all_plans: Vec<SubQuery> = Vec::new();
        let mut all_results: Vec<SubQueryResult> = Vec::new();
        let mut iterations_run = 0u32;

        for iteration in 1..=max_iterations {
            if cancel.is_canceled() {
                return Err(OrchestratorError::Canceled { request_id });
            }

            let prior_results = (iteration > 1).then_some(all_results.as_slice());
            let (artifact, planning_usage) = self
                .planning
                .plan(
                    &params,
                    complexity,
                    &past_summaries,
                    prior_results,
                    iteration,
                    &events,
                )
                .await?;
            usage.add(&planning_usage);

            let plan = match artifact {
                PlanArtifact::Plan(plan) => plan,
                PlanArtifact::PlanComplete if iteration == 1 => {
                    return Err(OrchestratorError::Planning(PlanningError {
                        reason: "planner declared completion before any research".to_string(),
                    }));
                }
                PlanArtifact::PlanComplete => break,
            };

            if cancel.is_canceled() {
                return Err(OrchestratorError::Canceled { request_id });
            }

            let results = self
                .research
                .conduct_parallel(&plan, &params, complexity, &events, &cancel)
                .await;
            for result in &results {
                if let Some(ref u) = result.usage {
                    usage.add(u);
                }
            }
            all_plans.extend(plan);
            all_results.extend(results);
            iterations_run = iteration;
        }

        if cancel.is_canceled() {
            return Err(OrchestratorError::Canceled { request_id });
        }

        let outcome = self
            .synthesis
            .synthesize_stream(
                &params,
                &all_results,
                &all_plans,
                complexity,
                request_id,
                &events,
                &cancel,
            )
            .await?;
        if let Some(ref u) = outcome.usage {
            usage.add(u);
        }

        let mut final_text = outcome.text;
        let mut warnings = Vec::new();

        // Optional post-synthesis fact-check annotation. Never fatal.
        let fact_check = if self.config.fact_check_enabled {
            self.fact_check(&params.query, &final_text).await
        } else {
            None
        };
        if let Some((_, notes)) = &fact_check {
            if !notes.is_empty() {
                final_text.push_str("\n\n## Research Quality Warnings\n");
                for note in notes {
                    final_text.push_str(&format!("- {note}\n"));
                }
            }
        }

        // Cache before persistence so a storage failure still primes both
        // tiers with the delivered text.
        self.cache
            .insert(&params, query_embedding.clone(), &final_text, None);

        let metadata = ResearchMetadata {
            duration_ms: started.elapsed().as_millis() as u64,
            iterations: iterations_run,
            sub_query_count: all_plans.len() as u32,
            usage,
            truncation_flagged: outcome.truncation_flagged,
            complexity: Some(complexity),
        };

        let report_id = match self
            .store
            .save_report(NewReport {
                query: params.query.clone(),
                params: params.clone(),
                final_report: final_text.clone(),
                metadata,
                based_on,
                embedding: query_embedding.clone(),
            })
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(request_id = %request_id, "report persistence failed: {e}");
                warnings.push(format!("report was not persisted: {e}"));
                None
            }
        };

        if let Some(id) = report_id {
            if let Some((score, notes)) = &fact_check {
                let _ = self
                    .store
                    .set_fact_check(id, *score, serde_json::json!({ "warnings": notes }))
                    .await;
            }
            // Re-cache with the durable report id attached.
            self.cache
                .insert(&params, query_embedding.clone(), &final_text, Some(id));
            if self.config.indexer_enabled {
                self.hybrid
                    .index_report_best_effort(id, &params.query, &final_text)
                    .await;
            }
        }

        let file_path = match report_id {
            Some(id) => match self.write_report_file(id, &final_text) {
                Ok(path) => Some(path),
                Err(e) => {
                    warnings.push(format!("report file was not written: {e}"));
                    None
                }
            },
            None => None,
        };

        emit(
            &events,
            ResearchEvent::ReportSaved {
                report_id,
                path: file_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
            },
        );

        // An inline warning prefix only when nothing durable exists; with a
        // persisted report the delivered text must equal the stored text,
        // and file-write warnings travel in the completion message instead.
        let text = if report_id.is_none() && !warnings.is_empty() {
            format!("> Warning: {}\n\n{final_text}", warnings.join("; "))
        } else {
            final_text
        };

        Ok(ResearchOutcome {
            text,
            report_id,
            file_path,
            from_cache: false,
            usage,
            warnings,
        })
    }

    fn write_report_file(&self, id: ReportId, text: &str) -> std::io::Result<PathBuf> {
        let dir = &self.config.report_output_path;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("research-report-{id}.md"));
        std::fs::write(&path, text)?;
        Ok(path)
    }

    /// One review call listing unverified or dubious claims. Returns
    /// (optional accuracy score, warning lines); `None` on any failure.
    async fn fact_check(&self, query: &str, text: &str) -> Option<(Option<f64>, Vec<String>)> {
        let model = self.config.low_cost_models.first()?.clone();
        let messages = [
            ChatMessage::system(
                "Review the report for factual risk. Answer as JSON: \
                 {\"score\": 0.0-1.0, \"warnings\": [\"…\"]}. Empty warnings if clean.",
            ),
            ChatMessage::user(format!("Query: {query}\n\nReport:\n{text}")),
        ];
        let options = ChatOptions {
            temperature: 0.0,
            max_tokens: 1024,
        };
        let response = match self.chat.chat_completion(&model, &messages, &options).await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("fact-check call failed: {e}");
                return None;
            }
        };
        let start = response.content.find('{')?;
        let end = response.content.rfind('}')?;
        let value: serde_json::Value =
            serde_json::from_str(&response.content[start..=end]).ok()?;
        let score = value.get("score").and_then(|v| v.as_f64());
        let warnings = value
            .get("warnings")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|w| w.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Some((score, warnings))
    }
}

fn cached_outcome(answer: String, report_id: Option<ReportId>) -> ResearchOutcome {
    ResearchOutcome {
        text: answer,
        report_id,
        file_path: None,
        from_cache: true,
        usage: TokenUsage::default(),
        warnings: Vec::new(),
    }
}
