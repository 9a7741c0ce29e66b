//! Durable persistence behind one capability surface.
//!
//! The orchestrator, audit log, and meter depend only on [`GatewayStore`];
//! the embedded sqlite implementation lives in [`sqlite`]. A networked
//! relational implementation can slot in without touching the callers.

mod sqlite;

pub use sqlite::SqliteStore;

use tg_domain::audit::{AuditEntry, AuditFilter, AuditStats};
use tg_domain::usage::UsageRow;
use tg_domain::Result;

pub trait GatewayStore: Send + Sync {
    /// Append one audit row. Insertion order is the verification order.
    fn insert_audit(&self, entry: &AuditEntry) -> Result<()>;

    /// Filtered query, newest first.
    fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>>;

    /// Hash of the most recently inserted audit row, if any.
    fn last_hash(&self) -> Result<Option<String>>;

    /// Every audit row in insertion order (chain verification).
    fn all_ordered(&self) -> Result<Vec<AuditEntry>>;

    /// Whole-log aggregates.
    fn stats(&self) -> Result<AuditStats>;

    /// Add a usage rollup row, summing counters on key conflict.
    fn upsert_usage(&self, row: &UsageRow) -> Result<()>;

    /// Usage rollup rows, optionally scoped to one consumer.
    fn query_usage(&self, consumer_id: Option<&str>) -> Result<Vec<UsageRow>>;

    /// Flush and release the underlying handle.
    fn close(&self) -> Result<()>;
}
