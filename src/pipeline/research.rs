//! Research stage: bounded-parallel execution of sub-query ensembles.
//!
//! Each sub-query fans out to an ensemble of 2–3 models running
//! concurrently; the full set of per-model results is returned without
//! reduction; synthesis performs the agreement analysis. There is no retry
//! inside an ensemble: diversity across models provides the fault tolerance.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::planning::{SubQuery, SOURCE_DISCIPLINE};
use super::tokens::adaptive_max_tokens;
use crate::events::{emit, EventSender, ResearchEvent};
use crate::provider::{ChatClient, ChatMessage, ChatOptions};
use crate::router::ModelRouter;
use crate::types::{CancelToken, Complexity, ResearchParams, TokenUsage};

/// Result of one ensemble member answering one sub-query.
#[derive(Debug, Clone)]
pub struct SubQueryResult {
    pub agent_id: u32,
    pub model: String,
    pub query: String,
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub error: bool,
    pub error_message: Option<String>,
}

/// Research stage.
pub struct ResearchStage {
    chat: Arc<dyn ChatClient>,
    router: Arc<ModelRouter>,
    parallelism: usize,
}

impl ResearchStage {
    pub fn new(chat: Arc<dyn ChatClient>, router: Arc<ModelRouter>, parallelism: usize) -> Self {
        Self {
            chat,
            router,
            parallelism: parallelism.max(1),
        }
    }

    /// Assess query complexity. The word-count heuristic nominates `simple`;
    /// a short classification call confirms or escalates.
    pub async fn assess_complexity(&self, query: &str, params: &ResearchParams) -> Complexity {
        let words = query.split_whitespace().count();
        let candidate = if words <= 15 {
            Complexity::Simple
        } else {
            Complexity::Moderate
        };

        let model = self.router.get_model(
            params.cost_preference,
            0,
            Some("classification"),
            Complexity::Simple,
        );
        let messages = [
            ChatMessage::system(
                "Classify the research query as exactly one word: simple, moderate, or complex. \
                 simple = single factual answer; moderate = needs a few angles; complex = \
                 multi-domain investigation.",
            ),
            ChatMessage::user(query.to_string()),
        ];
        let options = ChatOptions {
            temperature: 0.0,
            max_tokens: 512,
        };

        match self.chat.chat_completion(&model, &messages, &options).await {
            Ok(response) => {
                let answer = response.content.trim().to_lowercase();
                if answer.contains("complex") {
                    Complexity::Complex
                } else if answer.contains("simple") {
                    Complexity::Simple
                } else if answer.contains("moderate") {
                    Complexity::Moderate
                } else {
                    candidate
                }
            }
            Err(e) => {
                tracing::debug!("complexity classification failed, using heuristic: {e}");
                candidate
            }
        }
    }

    /// Fan the sub-queries out under the concurrency cap. Returns one
    /// [`SubQueryResult`] per ensemble member, success or error; the stage
    /// resolves only after every member has.
    pub async fn conduct_parallel(
        &self,
        sub_queries: &[SubQuery],
        params: &ResearchParams,
        complexity: Complexity,
        events: &EventSender,
        cancel: &CancelToken,
    ) -> Vec<SubQueryResult> {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let has_images = !params.images.is_empty();

        let mut tasks = Vec::new();
        for sub_query in sub_queries {
            let ensemble = self.router.ensemble(
                params.cost_preference,
                sub_query.id as usize,
                sub_query.domain.as_deref(),
                complexity,
                has_images,
            );
            for model in ensemble {
                let semaphore = semaphore.clone();
                let chat = self.chat.clone();
                let router = self.router.clone();
                let events = events.clone();
                let cancel = cancel.clone();
                let params = params.clone();
                let sub_query = sub_query.clone();

                tasks.push(tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return error_result(&sub_query, &model, "executor closed"),
                    };
                    if cancel.is_canceled() {
                        return error_result(&sub_query, &model, "canceled");
                    }
                    run_agent(chat, router, &sub_query, &model, &params, &events).await
                }));
            }
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in join_all(tasks).await {
            match task {
                Ok(result) => results.push(result),
                Err(e) => tracing::warn!("research task panicked: {e}"),
            }
        }
        results
    }
}

fn error_result(sub_query: &SubQuery, model: &str, message: &str) -> SubQueryResult {
    SubQueryResult {
        agent_id: sub_query.id,
        model: model.to_string(),
        query: sub_query.query.clone(),
        text: String::new(),
        usage: None,
        error: true,
        error_message: Some(message.to_string()),
    }
}

async fn run_agent(
    chat: Arc<dyn ChatClient>,
    router: Arc<ModelRouter>,
    sub_query: &SubQuery,
    model: &str,
    params: &ResearchParams,
    events: &EventSender,
) -> SubQueryResult {
    emit(
        events,
        ResearchEvent::AgentStarted {
            agent_id: sub_query.id,
            model: model.to_string(),
            query: sub_query.query.clone(),
        },
    );

    let mut system = format!(
        "You are research agent {} running on {model}. Answer the question for a {:?} \
         audience. {SOURCE_DISCIPLINE}",
        sub_query.id, params.audience_level,
    );
    for doc in &params.text_documents {
        let snippet: String = doc.content.chars().take(500).collect();
        system.push_str(&format!("\n\nAttached document '{}':\n{snippet}", doc.name));
    }
    for data in &params.structured_data {
        system.push_str(&format!(
            "\n\nStructured data '{}': {}",
            data.name, data.data
        ));
    }

    let vision_capable = router.catalog().is_vision_capable(model);
    let image_urls: Vec<String> = if vision_capable {
        params.images.iter().filter_map(|i| i.part_url()).collect()
    } else {
        // Images are dropped silently for text-only models; the ensemble's
        // vision member covers them.
        Vec::new()
    };

    let user = if image_urls.is_empty() {
        ChatMessage::user(sub_query.query.clone())
    } else {
        ChatMessage::user_with_images(
            format!(
                "{}\n\nExtract any relevant visual elements from the attached images.",
                sub_query.query
            ),
            image_urls,
        )
    };

    let prompt_chars = system.len() + sub_query.query.len();
    let options = ChatOptions {
        temperature: 0.3,
        max_tokens: adaptive_max_tokens(router.context_window(model), prompt_chars),
    };
    let messages = [ChatMessage::system(system), user];

    match chat.chat_completion(model, &messages, &options).await {
        Ok(response) => {
            emit(
                events,
                ResearchEvent::AgentUsage {
                    agent_id: sub_query.id,
                    model: model.to_string(),
                    usage: response.usage,
                },
            );
            emit(
                events,
                ResearchEvent::AgentCompleted {
                    agent_id: sub_query.id,
                    model: model.to_string(),
                    ok: true,
                },
            );
            SubQueryResult {
                agent_id: sub_query.id,
                model: response.model,
                query: sub_query.query.clone(),
                text: response.content,
                usage: Some(response.usage),
                error: false,
                error_message: None,
            }
        }
        Err(e) => {
            emit(
                events,
                ResearchEvent::AgentCompleted {
                    agent_id: sub_query.id,
                    model: model.to_string(),
                    ok: false,
                },
            );
            tracing::warn!(model, agent_id = sub_query.id, "sub-query call failed: {e}");
            error_result(sub_query, model, &e.to_string())
        }
    }
}

/// `MAX_ITERATIONS` for a request: simple→1, moderate→configured default,
/// complex→default+1.
pub fn max_iterations_for(complexity: Complexity, configured_default: u32) -> u32 {
    match complexity {
        Complexity::Simple => 1,
        Complexity::Moderate => configured_default.max(1),
        Complexity::Complex => configured_default.max(1) + 1,
    }
}
