//! Shared identifier and value types for the research orchestrator.

pub mod error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Server-assigned monotonic report identifier.
pub type ReportId = i64;

/// Opaque job identifier of the form `job_<millis>_<random>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh job id from the current wall clock plus a random suffix.
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis();
        let suffix: String = {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            (0..8)
                .map(|_| {
                    let c = rng.gen_range(0..36u8);
                    char::from_digit(c as u32, 36).unwrap_or('0')
                })
                .collect()
        };
        JobId(format!("job_{millis}_{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-request identifier, threaded through events and observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(uuid::Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cost preference for a research request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CostTier {
    #[default]
    Low,
    High,
}

/// Audience the final report is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudienceLevel {
    Beginner,
    #[default]
    Intermediate,
    Expert,
}

/// Voice of the synthesized output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Report,
    Briefing,
    BulletPoints,
}

/// Assessed complexity of the original query; bounds the iteration count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

/// Lifecycle status of an async job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Token accounting reported by chat-completion providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Image attached to a research request. Either a remote URL or inline
/// base64 data; vision-capable models receive these as image parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl ImageAttachment {
    /// URL form usable as a chat image part: the remote URL when present,
    /// otherwise a `data:` URL synthesized from the inline base64 payload.
    /// `None` only when the attachment carries neither.
    pub fn part_url(&self) -> Option<String> {
        if let Some(url) = &self.url {
            return Some(url.clone());
        }
        self.data.as_ref().map(|data| {
            let media_type = self.media_type.as_deref().unwrap_or("image/png");
            format!("data:{media_type};base64,{data}")
        })
    }
}

/// Plain-text document attached to a research request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDocument {
    pub name: String,
    pub content: String,
}

/// Tabular or otherwise structured data attached to a research request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredData {
    pub name: String,
    pub data: serde_json::Value,
}

/// Canonical, normalized arguments of a research request. The exact-parameter
/// cache key is a hash over this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchParams {
    pub query: String,
    #[serde(default)]
    pub cost_preference: CostTier,
    #[serde(default)]
    pub audience_level: AudienceLevel,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default = "default_true")]
    pub include_sources: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub text_documents: Vec<TextDocument>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub structured_data: Vec<StructuredData>,
}

fn default_true() -> bool {
    true
}

impl ResearchParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            cost_preference: CostTier::Low,
            audience_level: AudienceLevel::Intermediate,
            output_format: OutputFormat::Report,
            include_sources: true,
            max_length: None,
            images: Vec::new(),
            text_documents: Vec::new(),
            structured_data: Vec::new(),
        }
    }
}

/// Feedback entry appended to a report. Ratings are clamped to 1–5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub rating: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Metadata accumulated while producing a report.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResearchMetadata {
    pub duration_ms: u64,
    pub iterations: u32,
    pub sub_query_count: u32,
    pub usage: TokenUsage,
    #[serde(default)]
    pub truncation_flagged: bool,
    #[serde(default)]
    pub complexity: Option<Complexity>,
}

/// A persisted research report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub query: String,
    pub params: ResearchParams,
    pub final_report: String,
    pub metadata: ResearchMetadata,
    #[serde(default)]
    pub based_on_past_report_ids: Vec<ReportId>,
    #[serde(default)]
    pub feedback: Vec<Feedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_check: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cooperative cancellation token threaded through the pipeline and its
/// children. Checked at stage boundaries, stream-delta boundaries, and
/// between sub-tasks in the bounded executor.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        if self.is_canceled() {
            return;
        }
        loop {
            let notified = self.inner.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
            if self.is_canceled() {
                return;
            }
        }
    }
}
