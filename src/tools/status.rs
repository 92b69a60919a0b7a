//! Server status and model catalog tools.

use super::ToolSurface;
use crate::embedding::EmbedderState;
use crate::types::error::OrchestratorError;

/// `get_server_status`: db state, embedder state, cache, jobs, convergence.
pub async fn get_server_status(
    surface: &ToolSurface,
) -> Result<serde_json::Value, OrchestratorError> {
    let services = surface.services();

    let (exact_entries, semantic_entries) = services.cache.stats();
    let job_counts = services.store.count_jobs_by_status().await?;
    let report_count = services.store.report_count().await?;
    let convergence = services.store.get_convergence_metrics(24).await?;

    let embedder_state = match services.embedder.state() {
        EmbedderState::Uninitialized => "uninitialized",
        EmbedderState::Ready => "ready",
        EmbedderState::Unavailable => "unavailable",
    };

    Ok(serde_json::json!({
        "database": {
            "state": services.store.state().as_str(),
            "identity": services.store.identity(),
            "reports": report_count,
        },
        "embedder": {
            "state": embedder_state,
            "dimension": services.embedder.dimension(),
        },
        "cache": {
            "exact_entries": exact_entries,
            "semantic_entries": semantic_entries,
        },
        "jobs": job_counts,
        "chat_provider_configured": services.chat.is_some(),
        "convergence": convergence,
    }))
}

/// `list_models`: catalog snapshot, optionally refreshed from the remote
/// listing first.
pub async fn list_models(
    surface: &ToolSurface,
    arguments: serde_json::Value,
) -> Result<serde_json::Value, OrchestratorError> {
    let refresh = arguments
        .get("refresh")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let catalog = surface.services().router.catalog();
    let mut refreshed = 0;
    if refresh {
        refreshed = catalog.refresh().await?;
    }

    let snapshot = catalog.snapshot();
    let models: Vec<serde_json::Value> = snapshot
        .list()
        .into_iter()
        .map(|entry| {
            serde_json::json!({
                "id": entry.id,
                "label": entry.label,
                "cost_per_mtok": entry.cost_per_mtok,
                "domains": entry.domains,
                "vision": entry.vision,
                "long_context": entry.long_context,
                "context_window": entry.context_window,
            })
        })
        .collect();

    Ok(serde_json::json!({
        "models": models,
        "count": snapshot.len(),
        "refreshed": refreshed,
        "tiers": {
            "very_low_cost": surface.services().config.very_low_cost_models,
            "low_cost": surface.services().config.low_cost_models,
            "high_cost": surface.services().config.high_cost_models,
        },
    }))
}
