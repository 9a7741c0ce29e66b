//! Embedded sqlite implementation of [`GatewayStore`].
//!
//! One connection behind a mutex: writes are serialized, which is exactly
//! the total order the audit hash chain needs. The `audit_log` table is
//! indexed on every filterable column; the `meter` table sums counters on
//! upsert.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;

use tg_domain::audit::{AuditEntry, AuditFilter, AuditStats, AuditStatus};
use tg_domain::usage::UsageRow;
use tg_domain::{Error, Result};

use super::GatewayStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id          TEXT PRIMARY KEY,
    timestamp   TEXT NOT NULL,
    consumer_id TEXT NOT NULL,
    api_key_id  TEXT NOT NULL,
    server_id   TEXT NOT NULL,
    tool        TEXT NOT NULL,
    args        TEXT,
    response    TEXT,
    latency_ms  INTEGER NOT NULL,
    status      TEXT NOT NULL,
    error       TEXT,
    prev_hash   TEXT,
    hash        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_consumer  ON audit_log(consumer_id);
CREATE INDEX IF NOT EXISTS idx_audit_server    ON audit_log(server_id);
CREATE INDEX IF NOT EXISTS idx_audit_status    ON audit_log(status);
CREATE INDEX IF NOT EXISTS idx_audit_tool      ON audit_log(tool);

CREATE TABLE IF NOT EXISTS meter (
    consumer_id      TEXT NOT NULL,
    server_id        TEXT NOT NULL,
    tool             TEXT NOT NULL,
    period_key       TEXT NOT NULL,
    calls            INTEGER NOT NULL DEFAULT 0,
    errors           INTEGER NOT NULL DEFAULT 0,
    total_latency_ms INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (consumer_id, server_id, tool, period_key)
);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    /// `":memory:"` opens an in-memory store.
    pub fn open(path: &str) -> Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        // WAL keeps readers off the writers' backs; in-memory stores just
        // ignore it.
        if let Err(e) = conn.pragma_update(None, "journal_mode", "WAL") {
            tracing::debug!(error = %e, "could not enable WAL");
        }
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        tracing::debug!(path, "audit store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
        let status: String = row.get("status")?;
        let status = AuditStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown audit status: {status}").into(),
            )
        })?;
        Ok(AuditEntry {
            id: row.get("id")?,
            timestamp: row.get("timestamp")?,
            consumer_id: row.get("consumer_id")?,
            credential_id: row.get("api_key_id")?,
            server_id: row.get("server_id")?,
            tool: row.get("tool")?,
            args: row.get("args")?,
            response: row.get("response")?,
            latency_ms: row.get::<_, i64>("latency_ms")?.max(0) as u64,
            status,
            error: row.get("error")?,
            prev_hash: row.get("prev_hash")?,
            hash: row.get("hash")?,
        })
    }
}

impl GatewayStore for SqliteStore {
    fn insert_audit(&self, entry: &AuditEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_log
               (id, timestamp, consumer_id, api_key_id, server_id, tool,
                args, response, latency_ms, status, error, prev_hash, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                entry.id,
                entry.timestamp,
                entry.consumer_id,
                entry.credential_id,
                entry.server_id,
                entry.tool,
                entry.args,
                entry.response,
                entry.latency_ms as i64,
                entry.status.as_str(),
                entry.error,
                entry.prev_hash,
                entry.hash,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<String> = Vec::new();

        if let Some(consumer) = &filter.consumer_id {
            clauses.push("consumer_id = ?");
            params.push(consumer.clone());
        }
        if let Some(server) = &filter.server_id {
            clauses.push("server_id = ?");
            params.push(server.clone());
        }
        if let Some(tool) = &filter.tool {
            clauses.push("tool = ?");
            params.push(tool.clone());
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            params.push(status.as_str().to_string());
        }
        if let Some(since) = &filter.since {
            clauses.push("timestamp >= ?");
            params.push(since.clone());
        }
        if let Some(until) = &filter.until {
            clauses.push("timestamp < ?");
            params.push(until.clone());
        }

        let mut sql = String::from("SELECT * FROM audit_log");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(
            " ORDER BY timestamp DESC LIMIT {} OFFSET {}",
            filter.limit.unwrap_or(100),
            filter.offset.unwrap_or(0)
        ));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), Self::row_to_entry)
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
    }

    fn last_hash(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let hash = conn
            .query_row(
                "SELECT hash FROM audit_log ORDER BY rowid DESC LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .map_err(storage_err)?;
        Ok(hash)
    }

    fn all_ordered(&self) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM audit_log ORDER BY rowid ASC")
            .map_err(storage_err)?;
        let rows = stmt.query_map([], Self::row_to_entry).map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
    }

    fn stats(&self) -> Result<AuditStats> {
        let conn = self.conn.lock();
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .map_err(storage_err)?;

        let mut stats = AuditStats {
            total: total.max(0) as u64,
            ..Default::default()
        };

        let mut by_status = conn
            .prepare("SELECT status, COUNT(*) FROM audit_log GROUP BY status")
            .map_err(storage_err)?;
        let rows = by_status
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(storage_err)?;
        for row in rows {
            let (status, count) = row.map_err(storage_err)?;
            stats.by_status.insert(status, count.max(0) as u64);
        }

        let mut by_server = conn
            .prepare("SELECT server_id, COUNT(*) FROM audit_log GROUP BY server_id")
            .map_err(storage_err)?;
        let rows = by_server
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(storage_err)?;
        for row in rows {
            let (server, count) = row.map_err(storage_err)?;
            stats.by_server.insert(server, count.max(0) as u64);
        }

        Ok(stats)
    }

    fn upsert_usage(&self, row: &UsageRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO meter
               (consumer_id, server_id, tool, period_key, calls, errors, total_latency_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(consumer_id, server_id, tool, period_key) DO UPDATE SET
               calls = calls + excluded.calls,
               errors = errors + excluded.errors,
               total_latency_ms = total_latency_ms + excluded.total_latency_ms",
            rusqlite::params![
                row.consumer_id,
                row.server_id,
                row.tool,
                row.period_key,
                row.calls as i64,
                row.errors as i64,
                row.total_latency_ms as i64,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    fn query_usage(&self, consumer_id: Option<&str>) -> Result<Vec<UsageRow>> {
        let conn = self.conn.lock();
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<UsageRow> {
            Ok(UsageRow {
                consumer_id: row.get(0)?,
                server_id: row.get(1)?,
                tool: row.get(2)?,
                period_key: row.get(3)?,
                calls: row.get::<_, i64>(4)?.max(0) as u64,
                errors: row.get::<_, i64>(5)?.max(0) as u64,
                total_latency_ms: row.get::<_, i64>(6)?.max(0) as u64,
            })
        };

        let sql_base = "SELECT consumer_id, server_id, tool, period_key,
                               calls, errors, total_latency_ms FROM meter";
        let rows = match consumer_id {
            Some(consumer) => {
                let mut stmt = conn
                    .prepare(&format!("{sql_base} WHERE consumer_id = ?1"))
                    .map_err(storage_err)?;
                let rows = stmt
                    .query_map([consumer], map_row)
                    .map_err(storage_err)?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            }
            None => {
                let mut stmt = conn.prepare(sql_base).map_err(storage_err)?;
                let rows = stmt
                    .query_map([], map_row)
                    .map_err(storage_err)?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            }
        };
        rows.map_err(storage_err)
    }

    fn close(&self) -> Result<()> {
        // Dropping the connection closes it; checkpoint eagerly so the WAL
        // does not outlive the process.
        let conn = self.conn.lock();
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            tracing::debug!(error = %e, "wal checkpoint failed");
        }
        Ok(())
    }
}

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
