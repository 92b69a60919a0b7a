//! Tool surface: named tools over the service graph.
//!
//! Every tool has the shape `fn(args, request_id, depth) → JSON`. Arguments
//! are normalized (aliases, promotions) and validated before dispatch; each
//! invocation is recorded as a tool observation for the convergence
//! metrics. Tools may call other tools through the surface; per-request
//! depth is tracked and capped.

pub mod args;
pub mod indexing;
pub mod research;
pub mod retrieve;
pub mod status;
pub mod web;

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;

use crate::server::Services;
use crate::store::observations::ToolObservation;
use crate::types::error::{OrchestratorError, ValidationError};
use crate::types::RequestId;

/// All tool names served by the surface.
pub const TOOL_NAMES: &[&str] = &[
    "research",
    "submit_research",
    "job_status",
    "cancel_job",
    "retrieve",
    "get_report",
    "list_research_history",
    "search_web",
    "fetch_url",
    "index_texts",
    "index_url",
    "search_index",
    "index_status",
    "get_server_status",
    "list_models",
];

/// Dispatcher over the service graph.
pub struct ToolSurface {
    services: Arc<Services>,
}

impl ToolSurface {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Invoke a tool by name. `depth` counts nested tool-to-tool calls;
    /// at the cap the call returns a structured error object instead of
    /// invoking.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: serde_json::Value,
        request_id: RequestId,
        depth: u8,
    ) -> Result<serde_json::Value, OrchestratorError> {
        if depth >= self.services.config.max_tool_depth {
            return Ok(serde_json::json!({ "error": "Max recursion depth reached" }));
        }

        let input_hash = short_hash(&arguments.to_string());
        let started = Instant::now();

        let result = self.invoke(name, arguments, request_id, depth).await;

        let observation = ToolObservation {
            tool_name: name.to_string(),
            input_hash,
            output_hash: result
                .as_ref()
                .ok()
                .map(|v| short_hash(&v.to_string())),
            success: result.is_ok(),
            latency_ms: started.elapsed().as_millis() as u64,
            error_category: result.as_ref().err().map(|e| e.category().to_string()),
            error_code: result
                .as_ref()
                .err()
                .map(|e| e.to_string().chars().take(120).collect()),
            request_id: Some(request_id.to_string()),
        };
        if let Err(e) = self.services.store.record_tool_observation(observation).await {
            tracing::debug!("observation write failed: {e}");
        }

        result
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
        request_id: RequestId,
        depth: u8,
    ) -> Result<serde_json::Value, OrchestratorError> {
        match name {
            "research" => research::research(self, arguments, request_id).await,
            "submit_research" => research::submit_research(self, arguments).await,
            "job_status" => research::job_status(self, arguments).await,
            "cancel_job" => research::cancel_job(self, arguments).await,
            "retrieve" => retrieve::retrieve(self, arguments).await,
            "get_report" => retrieve::get_report(self, arguments).await,
            "list_research_history" => retrieve::list_research_history(self, arguments).await,
            "search_web" => web::search_web(self, arguments).await,
            "fetch_url" => web::fetch_url(self, arguments).await,
            "index_texts" => indexing::index_texts(self, arguments).await,
            "index_url" => indexing::index_url(self, arguments, request_id, depth).await,
            "search_index" => indexing::search_index(self, arguments).await,
            "index_status" => indexing::index_status(self).await,
            "get_server_status" => status::get_server_status(self).await,
            "list_models" => status::list_models(self, arguments).await,
            other => Err(ValidationError::UnknownTool {
                name: other.to_string(),
            }
            .into()),
        }
    }
}

/// First 16 hex characters of the SHA-256 of the input.
fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testutil::scripted_services;

    #[tokio::test]
    async fn unknown_tool_is_a_validation_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let services = scripted_services(vec![], &dir).await;
        let surface = ToolSurface::new(services);

        let err = surface
            .dispatch("not_a_tool", serde_json::json!({}), RequestId::new(), 0)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[tokio::test]
    async fn depth_cap_returns_structured_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let services = scripted_services(vec![], &dir).await;
        let surface = ToolSurface::new(services);

        let value = surface
            .dispatch("get_server_status", serde_json::json!({}), RequestId::new(), 3)
            .await
            .unwrap();
        assert_eq!(value["error"], "Max recursion depth reached");
    }

    #[tokio::test]
    async fn dispatch_records_observations() {
        let dir = tempfile::TempDir::new().unwrap();
        let services = scripted_services(vec![], &dir).await;
        let surface = ToolSurface::new(services.clone());

        surface
            .dispatch("index_status", serde_json::json!({}), RequestId::new(), 0)
            .await
            .unwrap();
        let _ = surface
            .dispatch("unknown", serde_json::json!({}), RequestId::new(), 0)
            .await;

        let metrics = services.store.get_convergence_metrics(1).await.unwrap();
        assert_eq!(metrics.total_calls, 2);
        assert_eq!(metrics.successes, 1);
        assert!(metrics
            .top_error_categories
            .iter()
            .any(|(cat, _)| cat == "validation"));
    }

    #[test]
    fn input_hashes_are_sixteen_hex_chars() {
        let hash = short_hash("{\"query\":\"x\"}");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, short_hash("{\"query\":\"x\"}"));
    }
}
