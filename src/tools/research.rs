//! Research tools: sync/async dispatch, job status, cancellation.

use super::args::{normalize_research_args, required_str, usize_or};
use super::ToolSurface;
use crate::types::error::{NotFoundError, OrchestratorError};
use crate::types::{CancelToken, JobId, RequestId};

/// `research`: sync when `async: false`, otherwise identical to
/// `submit_research`.
pub async fn research(
    surface: &ToolSurface,
    arguments: serde_json::Value,
    request_id: RequestId,
) -> Result<serde_json::Value, OrchestratorError> {
    let normalized = normalize_research_args(arguments)?;

    if normalized.run_async {
        return submit_normalized(surface, normalized).await;
    }

    let pipeline = surface.services().pipeline()?.clone();
    // Sync requests stream progress on the event channel; the transport
    // decides whether to forward it. Here the result carries the full text.
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let drain = tokio::spawn(async move { while events_rx.recv().await.is_some() {} });

    let outcome = pipeline
        .run_research(normalized.params, request_id, events_tx, CancelToken::new())
        .await;
    let _ = drain.await;
    let outcome = outcome?;

    Ok(serde_json::json!({
        "text": outcome.text,
        "report_id": outcome.report_id,
        "file_path": outcome.file_path.as_ref().map(|p| p.display().to_string()),
        "from_cache": outcome.from_cache,
        "usage": outcome.usage,
        "warnings": outcome.warnings,
    }))
}

/// `submit_research`: always async.
pub async fn submit_research(
    surface: &ToolSurface,
    arguments: serde_json::Value,
) -> Result<serde_json::Value, OrchestratorError> {
    let normalized = normalize_research_args(arguments)?;
    submit_normalized(surface, normalized).await
}

async fn submit_normalized(
    surface: &ToolSurface,
    normalized: super::args::NormalizedResearch,
) -> Result<serde_json::Value, OrchestratorError> {
    let jobs = surface.services().jobs()?;
    let params = serde_json::to_value(&normalized.params)
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    let receipt = jobs
        .submit("research", params, normalized.idempotency_key)
        .await?;
    Ok(serde_json::json!({
        "job_id": receipt.job_id,
        "sse_url": receipt.sse_url,
        "ui_url": receipt.ui_url,
        "duplicate": receipt.duplicate,
    }))
}

/// `job_status`: one-line summary, full record, or an event page.
pub async fn job_status(
    surface: &ToolSurface,
    arguments: serde_json::Value,
) -> Result<serde_json::Value, OrchestratorError> {
    let job_id = JobId(required_str(&arguments, "job_id")?);
    let format = arguments
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("summary");

    let store = &surface.services().store;
    let job = store
        .get_job(&job_id)
        .await?
        .ok_or(NotFoundError::Job(job_id.clone()))?;

    match format {
        "summary" => {
            let progress = match (job.progress_percent, &job.progress_message) {
                (Some(pct), Some(msg)) => format!(" — {pct:.0}% {msg}"),
                (Some(pct), None) => format!(" — {pct:.0}%"),
                _ => String::new(),
            };
            Ok(serde_json::json!({
                "status": job.status.as_str(),
                "summary": format!(
                    "{} [{}]{} (created {})",
                    job.job_id, job.status.as_str(), progress, job.created_at.to_rfc3339()
                ),
            }))
        }
        "full" => Ok(serde_json::json!({
            "job_id": job.job_id,
            "type": job.job_type,
            "status": job.status.as_str(),
            "params": job.params,
            "progress_percent": job.progress_percent,
            "progress_message": job.progress_message,
            "result": job.result,
            "canceled": job.canceled,
            "created_at": job.created_at.to_rfc3339(),
            "started_at": job.started_at.map(|t| t.to_rfc3339()),
            "finished_at": job.finished_at.map(|t| t.to_rfc3339()),
            "heartbeat_at": job.heartbeat_at.map(|t| t.to_rfc3339()),
        })),
        "events" => {
            let since = arguments
                .get("since_event_id")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let limit = usize_or(&arguments, "max_events", 100);
            let events = store.get_job_events(&job_id, since, limit).await?;
            let rows: Vec<serde_json::Value> = events
                .into_iter()
                .map(|e| {
                    serde_json::json!({
                        "id": e.id,
                        "timestamp": e.created_at.to_rfc3339(),
                        "event_type": e.event_type,
                        "payload": e.payload,
                    })
                })
                .collect();
            Ok(serde_json::json!({ "status": job.status.as_str(), "events": rows }))
        }
        other => Err(crate::types::error::ValidationError::InvalidValue {
            field: "format".to_string(),
            reason: format!("unknown format: {other}"),
        }
        .into()),
    }
}

/// `cancel_job`: set the canceled flag; best-effort stop.
pub async fn cancel_job(
    surface: &ToolSurface,
    arguments: serde_json::Value,
) -> Result<serde_json::Value, OrchestratorError> {
    let job_id = JobId(required_str(&arguments, "job_id")?);
    let found = surface.services().store.cancel_job(&job_id).await?;
    if !found {
        return Err(NotFoundError::Job(job_id).into());
    }
    Ok(serde_json::json!({ "canceled": true }))
}

#[cfg(test)]
mod tests {
    use super::super::ToolSurface;
    use crate::server::testutil::scripted_services;
    use crate::types::RequestId;
    use std::time::Duration;

    const PLAN: &str = "<subquery>What is a quorum?</subquery>";
    const ANSWER: &str = "A quorum is a majority. [Source: Docs — https://example.com] High.";

    fn script() -> Vec<(&'static str, &'static str)> {
        vec![
            ("Query:", PLAN),
            ("What is a quorum", ANSWER),
            ("Original query", ANSWER),
        ]
    }

    async fn surface(dir: &tempfile::TempDir) -> ToolSurface {
        ToolSurface::new(scripted_services(script(), dir).await)
    }

    #[tokio::test]
    async fn sync_research_returns_text_and_report_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;

        let value = surface
            .dispatch(
                "research",
                serde_json::json!({ "query": "define quorum", "async": false }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();
        assert!(value["text"].as_str().unwrap().contains("[Source:"));
        assert!(value["report_id"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn async_research_round_trips_params() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;

        let receipt = surface
            .dispatch(
                "research",
                serde_json::json!({ "q": "define quorum", "cost": "high" }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();
        let job_id = receipt["job_id"].as_str().unwrap().to_string();
        assert!(receipt["sse_url"].as_str().unwrap().contains(&job_id));

        // Round-trip law: stored params deep-equal the normalized input.
        let full = surface
            .dispatch(
                "job_status",
                serde_json::json!({ "job_id": job_id, "format": "full" }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();
        assert_eq!(full["params"]["query"], "define quorum");
        assert_eq!(full["params"]["cost_preference"], "high");
    }

    #[tokio::test]
    async fn job_status_summary_and_events() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;

        let receipt = surface
            .dispatch(
                "submit_research",
                serde_json::json!({ "query": "define quorum" }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();
        let job_id = receipt["job_id"].as_str().unwrap().to_string();

        // Wait for the worker to finish.
        for _ in 0..200 {
            let summary = surface
                .dispatch(
                    "job_status",
                    serde_json::json!({ "job_id": job_id, "format": "summary" }),
                    RequestId::new(),
                    0,
                )
                .await
                .unwrap();
            if summary["status"] == "succeeded" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let events = surface
            .dispatch(
                "job_status",
                serde_json::json!({ "job_id": job_id, "format": "events", "max_events": 3 }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap();
        let rows = events["events"].as_array().unwrap();
        assert!(rows.len() <= 3);
        assert_eq!(rows[0]["event_type"], "submitted");
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;
        let err = surface
            .dispatch(
                "cancel_job",
                serde_json::json!({ "job_id": "job_0_missing0" }),
                RequestId::new(),
                0,
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), "not_found");
    }
}
