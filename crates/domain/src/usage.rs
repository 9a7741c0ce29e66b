//! Usage metering data model.
//!
//! In-memory buckets aggregate per `(consumer, server, tool, period)` and
//! flush to durable rollup rows on period change. The period key is hourly,
//! `YYYY-MM-DDTHH` in UTC.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Format an instant as a period key (`YYYY-MM-DDTHH`, UTC).
pub fn period_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H").to_string()
}

/// The current period key.
pub fn current_period_key() -> String {
    period_key(Utc::now())
}

/// One durable rollup row. Counters are summed on upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRow {
    pub consumer_id: String,
    pub server_id: String,
    pub tool: String,
    pub period_key: String,
    pub calls: u64,
    pub errors: u64,
    pub total_latency_ms: u64,
}

/// Aggregated view over rollup rows, optionally scoped to one consumer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_calls: u64,
    pub total_errors: u64,
    /// Integer average, truncating division.
    pub avg_latency_ms: u64,
    pub by_server: HashMap<String, u64>,
    pub by_tool: HashMap<String, u64>,
}

impl UsageSummary {
    /// Sum rows into a summary. `avg_latency_ms` truncates.
    pub fn from_rows(rows: &[UsageRow]) -> Self {
        let mut summary = UsageSummary::default();
        let mut total_latency = 0u64;
        for row in rows {
            summary.total_calls += row.calls;
            summary.total_errors += row.errors;
            total_latency += row.total_latency_ms;
            *summary.by_server.entry(row.server_id.clone()).or_default() += row.calls;
            *summary.by_tool.entry(row.tool.clone()).or_default() += row.calls;
        }
        if summary.total_calls > 0 {
            summary.avg_latency_ms = total_latency / summary.total_calls;
        }
        summary
    }
}
