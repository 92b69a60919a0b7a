//! Closed set of research events.
//!
//! One producer (the pipeline), two consumers: the job event-log writer and
//! the sync progress stream. Unknown event types must be ignored by clients,
//! so the set here is additive-only.

use serde::{Deserialize, Serialize};

use crate::types::{JobStatus, ReportId, TokenUsage};

/// Event emitted during a research request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ResearchEvent {
    /// Job accepted into the durable queue.
    Submitted { tool: String },
    /// Informational hint for UIs (progress messages, URLs).
    UiHint { message: String },
    /// Opaque client-supplied context echoed into the log.
    ClientContext { payload: serde_json::Value },
    /// Token usage of a planning call.
    PlanningUsage { iteration: u32, usage: TokenUsage },
    /// One ensemble member started on a sub-query.
    AgentStarted {
        agent_id: u32,
        model: String,
        query: String,
    },
    /// Token usage of one ensemble member.
    AgentUsage {
        agent_id: u32,
        model: String,
        usage: TokenUsage,
    },
    /// One ensemble member finished.
    AgentCompleted {
        agent_id: u32,
        model: String,
        ok: bool,
    },
    /// Streaming synthesis content delta.
    SynthesisToken { delta: String },
    /// Token usage of the synthesis call.
    SynthesisUsage { usage: TokenUsage },
    /// Synthesis stream failed.
    SynthesisError { message: String },
    /// Final report persisted (or persistence failed with `report_id: null`).
    ReportSaved {
        report_id: Option<ReportId>,
        path: Option<String>,
    },
    /// Terminal status transition of the owning job.
    Status {
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ResearchEvent {
    /// Wire name of the event, matching the `event_type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            ResearchEvent::Submitted { .. } => "submitted",
            ResearchEvent::UiHint { .. } => "ui_hint",
            ResearchEvent::ClientContext { .. } => "client_context",
            ResearchEvent::PlanningUsage { .. } => "planning_usage",
            ResearchEvent::AgentStarted { .. } => "agent_started",
            ResearchEvent::AgentUsage { .. } => "agent_usage",
            ResearchEvent::AgentCompleted { .. } => "agent_completed",
            ResearchEvent::SynthesisToken { .. } => "synthesis_token",
            ResearchEvent::SynthesisUsage { .. } => "synthesis_usage",
            ResearchEvent::SynthesisError { .. } => "synthesis_error",
            ResearchEvent::ReportSaved { .. } => "report_saved",
            ResearchEvent::Status { .. } => "status",
        }
    }
}

/// Channel end handed to the pipeline. Sends never block; a dropped receiver
/// just discards progress (the event log remains authoritative for jobs).
pub type EventSender = tokio::sync::mpsc::UnboundedSender<ResearchEvent>;

/// Emit an event, ignoring a closed channel.
pub fn emit(events: &EventSender, event: ResearchEvent) {
    if let Err(e) = events.send(event) {
        tracing::debug!("event channel closed: {e}");
    }
}
