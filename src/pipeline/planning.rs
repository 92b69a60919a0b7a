//! Planning stage: decompose a query into structured sub-queries.
//!
//! The planner model answers with either tag-delimited or JSON sub-query
//! lists; the parser tolerates both. On refinement iterations the planner is
//! fed prior results and may answer `plan_complete` instead.

use regex::Regex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::research::SubQueryResult;
use crate::events::{emit, EventSender, ResearchEvent};
use crate::provider::{ChatClient, ChatMessage, ChatOptions};
use crate::router::ModelRouter;
use crate::types::error::{OrchestratorError, PlanningError};
use crate::types::{Complexity, ResearchParams};

/// Process-unique sub-query id source, monotonic across iterations.
static NEXT_SUBQUERY_ID: AtomicU32 = AtomicU32::new(1);

fn next_subquery_id() -> u32 {
    NEXT_SUBQUERY_ID.fetch_add(1, Ordering::Relaxed)
}

/// One focused question produced by planning.
#[derive(Debug, Clone, PartialEq)]
pub struct SubQuery {
    pub id: u32,
    pub query: String,
    pub domain: Option<String>,
    pub rationale: Option<String>,
}

/// Outcome of one planning call.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanArtifact {
    Plan(Vec<SubQuery>),
    PlanComplete,
}

/// Compact-mode prompt discipline shared by planning and research calls.
pub const SOURCE_DISCIPLINE: &str = "Prefer official and primary sources. Require explicit URL \
citations for factual claims. Label claims you cannot verify as [Unverified]. Bias toward \
verification questions. Never fabricate identifiers, package names, or URLs.";

/// Planning stage.
pub struct PlanningStage {
    chat: Arc<dyn ChatClient>,
    router: Arc<ModelRouter>,
}

impl PlanningStage {
    pub fn new(chat: Arc<dyn ChatClient>, router: Arc<ModelRouter>) -> Self {
        Self { chat, router }
    }

    /// Run one planning call. `past_summaries` are similarity-gated prior
    /// reports; `prior_results` switches the call into refinement mode.
    /// Returns the artifact plus the planner's token usage.
    pub async fn plan(
        &self,
        params: &ResearchParams,
        complexity: Complexity,
        past_summaries: &[String],
        prior_results: Option<&[SubQueryResult]>,
        iteration: u32,
        events: &EventSender,
    ) -> Result<(PlanArtifact, crate::types::TokenUsage), OrchestratorError> {
        let model = self
            .router
            .get_model(params.cost_preference, 0, Some("reasoning"), complexity);
        let refinement = prior_results.is_some();

        let system = format!(
            "You are a research planner. Decompose the user's query into focused sub-queries, \
             one per line, each wrapped as <subquery domain=\"general\">question</subquery>. \
             Use 1 sub-query for simple questions and up to 5 for complex ones. {SOURCE_DISCIPLINE}"
        );

        let mut user = String::new();
        user.push_str(&format!("Query: {}\n", params.query));
        user.push_str(&format!("Audience: {:?}\n", params.audience_level));

        if !past_summaries.is_empty() {
            user.push_str("\nRelated prior research:\n");
            for summary in past_summaries {
                user.push_str(&format!("- {summary}\n"));
            }
        }
        for doc in &params.text_documents {
            let snippet: String = doc.content.chars().take(500).collect();
            user.push_str(&format!("\nAttached document '{}':\n{snippet}\n", doc.name));
        }
        for data in &params.structured_data {
            user.push_str(&format!(
                "\nStructured data '{}': {} top-level entries\n",
                data.name,
                summarize_structure(&data.data)
            ));
        }

        if let Some(prior) = prior_results {
            user.push_str("\nResults so far:\n");
            for result in prior {
                let status = if result.error { "FAILED" } else { "ok" };
                let excerpt: String = result.text.chars().take(300).collect();
                user.push_str(&format!(
                    "- [{status}] {} → {excerpt}\n",
                    result.query
                ));
            }
            user.push_str(
                "\nEither emit additional <subquery> lines that fill remaining gaps, or \
                 answer exactly plan_complete if the results already cover the query.\n",
            );
        }

        let images_for_planner = if params.images.is_empty() {
            Vec::new()
        } else if self.router.catalog().is_vision_capable(&model) {
            params
                .images
                .iter()
                .filter_map(|img| img.part_url())
                .collect()
        } else {
            Vec::new()
        };

        let messages = vec![
            ChatMessage::system(system),
            if images_for_planner.is_empty() {
                ChatMessage::user(user)
            } else {
                ChatMessage::user_with_images(user, images_for_planner)
            },
        ];

        let options = ChatOptions {
            temperature: 0.3,
            max_tokens: super::tokens::adaptive_max_tokens(
                self.router.context_window(&model),
                messages.iter().map(message_chars).sum(),
            ),
        };

        let response = self
            .chat
            .chat_completion(&model, &messages, &options)
            .await
            .map_err(|e| {
                if refinement {
                    // A failed refinement call ends the loop rather than the
                    // request.
                    tracing::warn!("refinement planning call failed: {e}");
                    OrchestratorError::Planning(PlanningError {
                        reason: format!("refinement failed: {e}"),
                    })
                } else {
                    OrchestratorError::Planning(PlanningError {
                        reason: format!("planner call failed: {e}"),
                    })
                }
            })?;

        emit(
            events,
            ResearchEvent::PlanningUsage {
                iteration,
                usage: response.usage,
            },
        );

        let artifact = parse_plan_artifact(&response.content, refinement)
            .map_err(OrchestratorError::Planning)?;
        Ok((artifact, response.usage))
    }
}

fn message_chars(message: &ChatMessage) -> usize {
    message
        .parts
        .iter()
        .map(|p| match p {
            crate::provider::ContentPart::Text { text } => text.len(),
            crate::provider::ContentPart::ImageUrl { .. } => 0,
        })
        .sum()
}

fn summarize_structure(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Array(items) => format!("array of {}", items.len()),
        serde_json::Value::Object(map) => format!("object with {} keys", map.len()),
        other => format!("{other}"),
    }
}

/// Parse planner output into a plan artifact.
///
/// Accepts tag-delimited `<subquery>` lines or a JSON array/object; the
/// `plan_complete` marker (or an empty refinement) ends the loop. Malformed
/// output is a hard failure only on the first iteration.
pub fn parse_plan_artifact(
    output: &str,
    refinement: bool,
) -> Result<PlanArtifact, PlanningError> {
    let trimmed = output.trim();

    if trimmed.to_lowercase().contains("plan_complete") {
        return Ok(PlanArtifact::PlanComplete);
    }

    let mut sub_queries = parse_tagged(trimmed);
    if sub_queries.is_empty() {
        sub_queries = parse_json_plan(trimmed);
    }

    if sub_queries.is_empty() {
        if refinement {
            tracing::debug!("unparseable refinement output treated as plan_complete");
            return Ok(PlanArtifact::PlanComplete);
        }
        return Err(PlanningError {
            reason: format!(
                "no sub-queries found in planner output: {}",
                trimmed.chars().take(200).collect::<String>()
            ),
        });
    }

    Ok(PlanArtifact::Plan(sub_queries))
}

fn parse_tagged(output: &str) -> Vec<SubQuery> {
    let re = Regex::new(r#"(?s)<subquery(?:\s+domain="([^"]*)")?\s*>(.*?)</subquery>"#)
        .expect("static regex");
    re.captures_iter(output)
        .filter_map(|cap| {
            let query = cap.get(2)?.as_str().trim().to_string();
            if query.is_empty() {
                return None;
            }
            Some(SubQuery {
                id: next_subquery_id(),
                query,
                domain: cap
                    .get(1)
                    .map(|m| m.as_str().trim().to_string())
                    .filter(|d| !d.is_empty()),
                rationale: None,
            })
        })
        .collect()
}

fn parse_json_plan(output: &str) -> Vec<SubQuery> {
    let Some(start) = output.find(['[', '{']) else {
        return Vec::new();
    };
    let candidate = &output[start..];
    let value: serde_json::Value = match serde_json::from_str(candidate) {
        Ok(v) => v,
        Err(_) => {
            // Try trimming trailing prose after the JSON body.
            let end = candidate.rfind([']', '}']).map(|i| i + 1).unwrap_or(0);
            match serde_json::from_str(&candidate[..end]) {
                Ok(v) => v,
                Err(_) => return Vec::new(),
            }
        }
    };

    let items = match &value {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::Object(map) => map
            .get("sub_queries")
            .or_else(|| map.get("subqueries"))
            .or_else(|| map.get("plan"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| {
            let (query, domain, rationale) = match item {
                serde_json::Value::String(s) => (s.clone(), None, None),
                serde_json::Value::Object(map) => (
                    map.get("query")
                        .or_else(|| map.get("q"))
                        .and_then(|v| v.as_str())?
                        .to_string(),
                    map.get("domain")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    map.get("rationale")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                ),
                _ => return None,
            };
            let query = query.trim().to_string();
            if query.is_empty() {
                return None;
            }
            Some(SubQuery {
                id: next_subquery_id(),
                query,
                domain,
                rationale,
            })
        })
        .collect()
}
