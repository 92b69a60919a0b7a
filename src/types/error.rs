//! Error taxonomy for the research orchestrator.
//!
//! Each kind carries a stable category code used on the wire; async job
//! failures serialize `{category, message, cause_chain}` into the job result.

use thiserror::Error;

use super::{JobId, ReportId, RequestId};

/// Top-level error type aggregating every subsystem.
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Embedder error: {0}")]
    Embedder(#[from] EmbedderError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Synthesis failed: {reason}")]
    Synthesis { reason: String },

    #[error("Request canceled: {request_id}")]
    Canceled { request_id: RequestId },

    #[error("Overloaded: {reason}")]
    Overloaded { reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Stable category code for the wire.
    pub fn category(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "validation",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::Planning(_) => "planning",
            OrchestratorError::Provider(e) => e.category(),
            OrchestratorError::Embedder(_) => "embedder",
            OrchestratorError::Storage(e) => e.category(),
            OrchestratorError::Synthesis { .. } => "synthesis",
            OrchestratorError::Canceled { .. } => "canceled",
            OrchestratorError::Overloaded { .. } => "overloaded",
            OrchestratorError::Internal(_) => "internal",
        }
    }

    /// Structured error payload stored in a failed job's result.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut chain = Vec::new();
        let mut source: Option<&dyn std::error::Error> = std::error::Error::source(self);
        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }
        serde_json::json!({
            "category": self.category(),
            "message": self.to_string(),
            "cause_chain": chain,
        })
    }
}

/// User-supplied arguments failed schema validation.
#[derive(Error, Debug, Clone)]
pub enum ValidationError {
    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("unknown field: {field}")]
    UnknownField { field: String },

    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("max recursion depth reached")]
    MaxDepth,
}

/// A referenced report or job does not exist.
#[derive(Error, Debug, Clone)]
pub enum NotFoundError {
    #[error("report {0} not found")]
    Report(ReportId),

    #[error("job {0} not found")]
    Job(JobId),
}

/// First-iteration planning produced no parseable sub-queries.
#[derive(Error, Debug, Clone)]
#[error("planner produced no usable sub-queries: {reason}")]
pub struct PlanningError {
    pub reason: String,
}

/// Sub-kind of a provider failure; drives caller retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    RateLimited,
    Transient,
    Permanent,
}

/// Remote chat-completion call failed.
#[derive(Error, Debug, Clone)]
#[error("{message}{}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            status: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            status: None,
            message: message.into(),
        }
    }

    pub fn from_status(status: u16, body: String) -> Self {
        let kind = match status {
            429 => ProviderErrorKind::RateLimited,
            500..=599 => ProviderErrorKind::Transient,
            _ => ProviderErrorKind::Permanent,
        };
        Self {
            kind,
            status: Some(status),
            message: body,
        }
    }

    fn category(&self) -> &'static str {
        match self.kind {
            ProviderErrorKind::RateLimited => "provider_rate_limited",
            ProviderErrorKind::Transient => "provider_transient",
            ProviderErrorKind::Permanent => "provider_permanent",
        }
    }
}

/// Embedding generation failed. Always treated as recoverable degradation:
/// call sites receive `None` and continue without vectors.
#[derive(Error, Debug, Clone)]
#[error("embedding failed: {reason}")]
pub struct EmbedderError {
    pub reason: String,
}

/// Persistence-layer failures.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("store initialization failed: {reason}")]
    Initialization { reason: String },

    #[error("store is not initialized yet (state: {state})")]
    NotInitialized { state: String },

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("rejected query: {reason}")]
    RejectedQuery { reason: String },
}

impl StorageError {
    pub fn database(reason: impl Into<String>) -> Self {
        StorageError::Database {
            reason: reason.into(),
        }
    }

    fn category(&self) -> &'static str {
        match self {
            StorageError::Initialization { .. } | StorageError::NotInitialized { .. } => {
                "initialization"
            }
            StorageError::RetryExhausted { .. } => "retry_exhausted",
            StorageError::Database { .. } => "storage",
            StorageError::RejectedQuery { .. } => "validation",
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_are_stable() {
        let err = OrchestratorError::from(ValidationError::MissingField {
            field: "query".into(),
        });
        assert_eq!(err.category(), "validation");

        let err = OrchestratorError::from(ProviderError::from_status(429, "slow down".into()));
        assert_eq!(err.category(), "provider_rate_limited");

        let err = OrchestratorError::from(StorageError::RetryExhausted {
            operation: "save_report".into(),
            attempts: 3,
            last_error: "disk full".into(),
        });
        assert_eq!(err.category(), "retry_exhausted");
    }

    #[test]
    fn provider_kind_from_status() {
        assert_eq!(
            ProviderError::from_status(429, String::new()).kind,
            ProviderErrorKind::RateLimited
        );
        assert_eq!(
            ProviderError::from_status(503, String::new()).kind,
            ProviderErrorKind::Transient
        );
        assert_eq!(
            ProviderError::from_status(400, String::new()).kind,
            ProviderErrorKind::Permanent
        );
    }

    #[test]
    fn wire_shape_carries_category() {
        let err = OrchestratorError::Synthesis {
            reason: "stream died".into(),
        };
        let wire = err.to_wire();
        assert_eq!(wire["category"], "synthesis");
        assert!(wire["message"].as_str().unwrap().contains("stream died"));
    }
}
