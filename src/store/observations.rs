//! Tool observations and usage counters.
//!
//! Observations are append-only and feed the convergence metrics exposed by
//! `get_server_status`; usage counters are incremented opportunistically when
//! an entity participates in a result set.

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::params;
use serde::Serialize;
use std::collections::HashMap;

use super::{now_rfc3339, ResearchStore};
use crate::types::error::StorageError;

/// One tool invocation record.
#[derive(Debug, Clone)]
pub struct ToolObservation {
    pub tool_name: String,
    pub input_hash: String,
    pub output_hash: Option<String>,
    pub success: bool,
    pub latency_ms: u64,
    pub error_category: Option<String>,
    pub error_code: Option<String>,
    pub request_id: Option<String>,
}

/// Convergence bucket derived from the success rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    Converged,
    NearConvergence,
    Improving,
    Learning,
    Divergent,
}

impl ConvergenceStatus {
    fn from_rate(rate: f64) -> Self {
        if rate >= 0.99 {
            ConvergenceStatus::Converged
        } else if rate >= 0.95 {
            ConvergenceStatus::NearConvergence
        } else if rate >= 0.80 {
            ConvergenceStatus::Improving
        } else if rate >= 0.50 {
            ConvergenceStatus::Learning
        } else {
            ConvergenceStatus::Divergent
        }
    }
}

/// Per-tool breakdown within the metrics window.
#[derive(Debug, Clone, Serialize)]
pub struct ToolBreakdown {
    pub tool_name: String,
    pub calls: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

/// Windowed convergence metrics.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceMetrics {
    pub window_hours: u32,
    pub total_calls: u64,
    pub successes: u64,
    pub convergence_rate: f64,
    pub status: ConvergenceStatus,
    pub tools: Vec<ToolBreakdown>,
    pub top_error_categories: Vec<(String, u64)>,
}

impl ResearchStore {
    /// Append a tool observation.
    pub async fn record_tool_observation(
        &self,
        observation: ToolObservation,
    ) -> Result<(), StorageError> {
        self.with_retry("record_tool_observation", move |conn| {
            conn.execute(
                "INSERT INTO tool_observations
                    (tool_name, input_hash, output_hash, success, latency_ms,
                     error_category, error_code, request_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    observation.tool_name,
                    observation.input_hash,
                    observation.output_hash,
                    observation.success as i64,
                    observation.latency_ms as i64,
                    observation.error_category,
                    observation.error_code,
                    observation.request_id,
                    now_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Compute convergence metrics over the trailing window.
    pub async fn get_convergence_metrics(
        &self,
        window_hours: u32,
    ) -> Result<ConvergenceMetrics, StorageError> {
        let cutoff = (Utc::now() - ChronoDuration::hours(window_hours as i64)).to_rfc3339();
        self.with_retry("get_convergence_metrics", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT tool_name, success, latency_ms, error_category
                 FROM tool_observations WHERE created_at >= ?1",
            )?;
            let mut rows = stmt.query(params![cutoff])?;

            let mut total = 0u64;
            let mut successes = 0u64;
            let mut per_tool: HashMap<String, (u64, u64, u64)> = HashMap::new();
            let mut errors: HashMap<String, u64> = HashMap::new();

            while let Some(row) = rows.next()? {
                let tool: String = row.get(0)?;
                let success: i64 = row.get(1)?;
                let latency: i64 = row.get(2)?;
                let category: Option<String> = row.get(3)?;

                total += 1;
                let entry = per_tool.entry(tool).or_default();
                entry.0 += 1;
                entry.2 += latency as u64;
                if success != 0 {
                    successes += 1;
                    entry.1 += 1;
                } else if let Some(cat) = category {
                    *errors.entry(cat).or_default() += 1;
                }
            }

            let rate = if total == 0 {
                1.0
            } else {
                successes as f64 / total as f64
            };

            let mut tools: Vec<ToolBreakdown> = per_tool
                .into_iter()
                .map(|(tool_name, (calls, ok, latency_sum))| ToolBreakdown {
                    tool_name,
                    calls,
                    success_rate: ok as f64 / calls as f64,
                    avg_latency_ms: latency_sum as f64 / calls as f64,
                })
                .collect();
            tools.sort_by(|a, b| b.calls.cmp(&a.calls));

            let mut top_error_categories: Vec<(String, u64)> = errors.into_iter().collect();
            top_error_categories.sort_by(|a, b| b.1.cmp(&a.1));
            top_error_categories.truncate(5);

            Ok(ConvergenceMetrics {
                window_hours,
                total_calls: total,
                successes,
                convergence_rate: rate,
                status: ConvergenceStatus::from_rate(rate),
                tools,
                top_error_categories,
            })
        })
        .await
    }

    /// Increment the usage counter for an entity.
    pub async fn increment_usage(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<(), StorageError> {
        let entity_type = entity_type.to_string();
        let entity_id = entity_id.to_string();
        self.with_retry("increment_usage", move |conn| {
            conn.execute(
                "INSERT INTO usage_counters (entity_type, entity_id, uses, last_used_at)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(entity_type, entity_id)
                 DO UPDATE SET uses = uses + 1, last_used_at = excluded.last_used_at",
                params![entity_type, entity_id, now_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    /// Current usage count for an entity.
    pub async fn get_usage(&self, entity_type: &str, entity_id: &str) -> Result<u64, StorageError> {
        let entity_type = entity_type.to_string();
        let entity_id = entity_id.to_string();
        self.with_retry("get_usage", move |conn| {
            let uses: Option<i64> = conn
                .query_row(
                    "SELECT uses FROM usage_counters WHERE entity_type = ?1 AND entity_id = ?2",
                    params![entity_type, entity_id],
                    |row| row.get(0),
                )
                .ok();
            Ok(uses.unwrap_or(0) as u64)
        })
        .await
    }
}
