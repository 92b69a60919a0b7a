//! HTTP transport: tool endpoints plus the per-job SSE event stream.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::jobs::broadcast::event_stream;
use crate::tools::ToolSurface;
use crate::types::error::OrchestratorError;
use crate::types::{JobId, RequestId};

/// Build the router.
pub fn router(surface: Arc<ToolSurface>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/tools/:name", post(call_tool))
        .route("/jobs/:id/events", get(job_events))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(surface)
}

/// Bind and serve until the process exits.
pub async fn serve(surface: Arc<ToolSurface>, addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr, "http transport ready");
    axum::serve(listener, router(surface)).await
}

async fn healthz(State(surface): State<Arc<ToolSurface>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "database": surface.services().store.state().as_str(),
    }))
}

async fn call_tool(
    State(surface): State<Arc<ToolSurface>>,
    Path(name): Path<String>,
    Json(arguments): Json<serde_json::Value>,
) -> impl IntoResponse {
    match surface.dispatch(&name, arguments, RequestId::new(), 0).await {
        Ok(result) => (StatusCode::OK, Json(result)),
        Err(e) => (status_for(&e), Json(e.to_wire())),
    }
}

fn status_for(error: &OrchestratorError) -> StatusCode {
    match error.category() {
        "validation" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "overloaded" => StatusCode::TOO_MANY_REQUESTS,
        "canceled" => StatusCode::CONFLICT,
        "provider_rate_limited" => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    since_event_id: i64,
}

async fn job_events(
    State(surface): State<Arc<ToolSurface>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let store = surface.services().store.clone();
    let stream = event_stream(
        store,
        JobId(id),
        query.since_event_id,
        Duration::from_millis(250),
    )
    .map(|row| {
        let event = Event::default()
            .id(row.id.to_string())
            .event(row.event_type.clone())
            .data(row.payload.to_string());
        Ok(event)
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
