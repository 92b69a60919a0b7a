//! Synthesis stage: stream the final report from all sub-query results.

use futures::StreamExt;
use std::sync::Arc;

use super::planning::SubQuery;
use super::research::SubQueryResult;
use super::tokens::{detect_truncation, synthesis_max_tokens};
use crate::events::{emit, EventSender, ResearchEvent};
use crate::provider::{ChatClient, ChatMessage, ChatOptions};
use crate::router::ModelRouter;
use crate::types::error::OrchestratorError;
use crate::types::{
    CancelToken, Complexity, OutputFormat, RequestId, ResearchParams, TokenUsage,
};

/// Result of a successful synthesis stream.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub truncation_flagged: bool,
}

/// Synthesis stage.
pub struct SynthesisStage {
    chat: Arc<dyn ChatClient>,
    router: Arc<ModelRouter>,
}

impl SynthesisStage {
    pub fn new(chat: Arc<dyn ChatClient>, router: Arc<ModelRouter>) -> Self {
        Self { chat, router }
    }

    /// Stream the final report. Content deltas are forwarded as
    /// `synthesis_token` events; a mid-stream error discards the partial
    /// content and fails the request (no persistence on synthesis failure).
    pub async fn synthesize_stream(
        &self,
        params: &ResearchParams,
        results: &[SubQueryResult],
        plan: &[SubQuery],
        complexity: Complexity,
        request_id: RequestId,
        events: &EventSender,
        cancel: &CancelToken,
    ) -> Result<SynthesisOutcome, OrchestratorError> {
        let model = self
            .router
            .get_model(params.cost_preference, 0, Some("reasoning"), complexity);

        let system = build_system_prompt(params);
        let user = build_user_prompt(params, results, plan);
        let prompt_chars = system.len() + user.len();
        let max_tokens = synthesis_max_tokens(
            self.router.context_window(&model),
            prompt_chars,
            plan.len(),
            params.text_documents.len(),
        );
        let options = ChatOptions {
            temperature: 0.3,
            max_tokens,
        };
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];

        let mut stream = self
            .chat
            .chat_completion_stream(&model, &messages, &options)
            .await
            .map_err(|e| OrchestratorError::Synthesis {
                reason: format!("synthesis call failed: {e}"),
            })?;

        let mut text = String::new();
        let mut usage: Option<TokenUsage> = None;

        while let Some(delta) = stream.next().await {
            if cancel.is_canceled() {
                return Err(OrchestratorError::Canceled { request_id });
            }
            if let Some(message) = delta.error {
                emit(
                    events,
                    ResearchEvent::SynthesisError {
                        message: message.clone(),
                    },
                );
                return Err(OrchestratorError::Synthesis { reason: message });
            }
            if let Some(chunk) = delta.content_delta {
                text.push_str(&chunk);
                emit(events, ResearchEvent::SynthesisToken { delta: chunk });
            }
            if let Some(u) = delta.usage {
                usage = Some(u);
            }
        }

        if text.trim().is_empty() {
            return Err(OrchestratorError::Synthesis {
                reason: "synthesis produced no content".to_string(),
            });
        }

        if let Some(u) = usage {
            emit(events, ResearchEvent::SynthesisUsage { usage: u });
        }

        let truncation_flagged = detect_truncation(&text, usage.as_ref(), max_tokens);
        if truncation_flagged {
            tracing::warn!(request_id = %request_id, "synthesis output flagged as truncated");
        }

        Ok(SynthesisOutcome {
            text,
            usage,
            truncation_flagged,
        })
    }
}

fn build_system_prompt(params: &ResearchParams) -> String {
    let voice = match params.output_format {
        OutputFormat::Report => "a structured research report with headed sections",
        OutputFormat::Briefing => "a concise executive briefing",
        OutputFormat::BulletPoints => "a bullet-point summary",
    };
    let sources = if params.include_sources {
        "Cite every factual claim as [Source: Title — https://…]."
    } else {
        "Cite key claims inline."
    };
    format!(
        "You are a research synthesizer. Write {voice} for a {:?} audience. Integrate all \
         sub-query results. List each sub-query's status (success or failure). Call out \
         consensus and contradictions across the models that answered the same sub-query. \
         {sources} Label any claim without a source as [Unverified]. Attach a High, Medium, \
         or Low confidence marker to each significant claim.",
        params.audience_level,
    )
}

fn build_user_prompt(
    params: &ResearchParams,
    results: &[SubQueryResult],
    plan: &[SubQuery],
) -> String {
    let mut out = format!("Original query: {}\n", params.query);
    if let Some(max_length) = params.max_length {
        out.push_str(&format!("Keep the report under {max_length} words.\n"));
    }

    for sub_query in plan {
        out.push_str(&format!("\n## Sub-query {}: {}\n", sub_query.id, sub_query.query));
        let members: Vec<&SubQueryResult> = results
            .iter()
            .filter(|r| r.agent_id == sub_query.id)
            .collect();
        if members.is_empty() {
            out.push_str("(no results)\n");
            continue;
        }
        for member in members {
            if member.error {
                out.push_str(&format!(
                    "[{}] FAILED: {}\n",
                    member.model,
                    member.error_message.as_deref().unwrap_or("unknown error")
                ));
            } else {
                out.push_str(&format!("[{}]\n{}\n", member.model, member.text));
            }
        }
    }

    if results.iter().all(|r| r.error) && !results.is_empty() {
        out.push_str(
            "\nEvery sub-query failed. Produce a report that acknowledges the failure, \
             summarizes what was attempted, and suggests next steps.\n",
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::ScriptedChat;
    use crate::router::catalog::CatalogHandle;
    use crate::config::OrchestratorConfig;

    fn test_router() -> Arc<ModelRouter> {
        let mut config = OrchestratorConfig::default();
        config.low_cost_models = vec!["t/one".into(), "t/two".into()];
        Arc::new(ModelRouter::new(&config, Arc::new(CatalogHandle::new(None))))
    }

    fn result(id: u32, model: &str, text: &str, error: bool) -> SubQueryResult {
        SubQueryResult {
            agent_id: id,
            model: model.to_string(),
            query: format!("q{id}"),
            text: text.to_string(),
            usage: None,
            error,
            error_message: error.then(|| "boom".to_string()),
        }
    }

    fn sub_query(id: u32) -> SubQuery {
        SubQuery {
            id,
            query: format!("q{id}"),
            domain: None,
            rationale: None,
        }
    }

    #[tokio::test]
    async fn streams_tokens_and_usage() {
        let chat = Arc::new(ScriptedChat::new(vec![(
            "Original query",
            "The answer. [Source: Docs — https://example.com] (High)",
        )]));
        let stage = SynthesisStage::new(chat, test_router());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let outcome = stage
            .synthesize_stream(
                &ResearchParams::new("root question"),
                &[result(1, "t/one", "detail", false)],
                &[sub_query(1)],
                Complexity::Simple,
                RequestId::new(),
                &tx,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.text.contains("[Source:"));
        assert!(!outcome.truncation_flagged);
        assert!(outcome.usage.is_some());

        drop(tx);
        let mut saw_token = false;
        let mut saw_usage = false;
        while let Some(event) = rx.recv().await {
            match event {
                ResearchEvent::SynthesisToken { .. } => saw_token = true,
                ResearchEvent::SynthesisUsage { .. } => saw_usage = true,
                _ => {}
            }
        }
        assert!(saw_token && saw_usage);
    }

    #[tokio::test]
    async fn all_failed_results_request_failure_report() {
        let params = ResearchParams::new("root");
        let results = vec![
            result(1, "t/one", "", true),
            result(1, "t/two", "", true),
        ];
        let prompt = build_user_prompt(&params, &results, &[sub_query(1)]);
        assert!(prompt.contains("Every sub-query failed"));
        assert!(prompt.contains("FAILED: boom"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream() {
        let chat = Arc::new(ScriptedChat::new(vec![]));
        let stage = SynthesisStage::new(chat, test_router());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = stage
            .synthesize_stream(
                &ResearchParams::new("root"),
                &[result(1, "t/one", "x", false)],
                &[sub_query(1)],
                Complexity::Simple,
                RequestId::new(),
                &tx,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Canceled { .. }));
    }

    #[test]
    fn system_prompt_carries_invariants() {
        let prompt = build_system_prompt(&ResearchParams::new("q"));
        assert!(prompt.contains("[Source: Title"));
        assert!(prompt.contains("[Unverified]"));
        assert!(prompt.contains("High, Medium, or Low"));
        assert!(prompt.contains("consensus and contradictions"));
    }
}
