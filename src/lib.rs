//! Parallax: a parallel multi-model LLM research orchestrator.
//!
//! Given a natural-language query plus optional attachments, the pipeline
//! decomposes it into sub-queries, fans each out to an ensemble of remote
//! models under bounded parallelism, and synthesizes a cited,
//! confidence-annotated report. Reports and their embeddings persist in a
//! SQLite store that also backs the durable job queue and the hybrid
//! BM25+vector index. The capability is exposed as named tools over
//! line-delimited stdio JSON-RPC and HTTP+SSE.

pub mod cache;
pub mod config;
pub mod embedding;
pub mod events;
pub mod index;
pub mod jobs;
pub mod pipeline;
pub mod provider;
pub mod router;
pub mod server;
pub mod store;
pub mod tools;
pub mod types;

pub use cache::SemanticCache;
pub use config::OrchestratorConfig;
pub use embedding::{Embedder, EmbedderState, EmbeddingService};
pub use events::ResearchEvent;
pub use index::HybridIndex;
pub use jobs::JobEngine;
pub use pipeline::{Pipeline, ResearchOutcome};
pub use provider::{ChatClient, HttpChatClient};
pub use router::ModelRouter;
pub use server::Services;
pub use store::ResearchStore;
pub use tools::ToolSurface;
pub use types::error::OrchestratorError;
pub use types::{
    AudienceLevel, CancelToken, Complexity, CostTier, JobId, JobStatus, OutputFormat, Report,
    ReportId, RequestId, ResearchParams, TokenUsage,
};
