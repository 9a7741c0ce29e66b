//! The tamper-evident audit log.
//!
//! Appends are serialized under one lock so the `prev_hash → hash` chain is
//! well-defined under concurrency. The running last-hash starts at
//! `"genesis"` and is reseeded from the last persisted row on reopen.
//! Webhook fan-out is fire-and-forget; its failures never fail the call.

use std::sync::Arc;

use parking_lot::Mutex;

use tg_domain::audit::{
    canonical_hash, now_timestamp, truncate_response, AuditEntry, AuditFilter, AuditStats,
    AuditStatus, VerifyReport, GENESIS,
};
use tg_domain::config::AuditConfig;
use tg_domain::Result;

use crate::store::GatewayStore;

/// Everything the pipeline knows about a terminal outcome; the log assigns
/// identity, time, and chain position.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub consumer_id: String,
    pub credential_id: String,
    pub server_id: String,
    pub tool: String,
    pub args: Option<String>,
    pub response: Option<String>,
    pub latency_ms: u64,
    pub status: AuditStatus,
    pub error: Option<String>,
}

pub struct AuditLog {
    store: Arc<dyn GatewayStore>,
    enabled: bool,
    chain: bool,
    /// Serializes writes; the chain requires a total order.
    last_hash: Mutex<String>,
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl AuditLog {
    /// Open the log over a store, reseeding the chain from the last
    /// persisted row.
    pub fn new(config: &AuditConfig, store: Arc<dyn GatewayStore>) -> Result<Self> {
        let last = store.last_hash()?.unwrap_or_else(|| GENESIS.to_string());
        Ok(Self {
            store,
            enabled: config.enabled,
            chain: config.chain,
            last_hash: Mutex::new(last),
            webhook_url: config.webhook_url.clone(),
            client: reqwest::Client::new(),
        })
    }

    /// Append one entry. Responses are truncated to the contract bound
    /// before persistence. Storage failures surface to the caller.
    pub fn log(&self, draft: AuditDraft) -> Result<AuditEntry> {
        let id = uuid::Uuid::new_v4().to_string();
        let timestamp = now_timestamp();
        let response = draft.response.map(|r| truncate_response(&r));

        if !self.enabled {
            let hash = canonical_hash(
                &id,
                &timestamp,
                &draft.consumer_id,
                &draft.server_id,
                &draft.tool,
                draft.status,
                None,
            );
            return Ok(AuditEntry {
                id,
                timestamp,
                consumer_id: draft.consumer_id,
                credential_id: draft.credential_id,
                server_id: draft.server_id,
                tool: draft.tool,
                args: draft.args,
                response,
                latency_ms: draft.latency_ms,
                status: draft.status,
                error: draft.error,
                prev_hash: None,
                hash,
            });
        }

        let mut last = self.last_hash.lock();
        let prev_hash = self.chain.then(|| last.clone());
        let hash = canonical_hash(
            &id,
            &timestamp,
            &draft.consumer_id,
            &draft.server_id,
            &draft.tool,
            draft.status,
            prev_hash.as_deref(),
        );
        let entry = AuditEntry {
            id,
            timestamp,
            consumer_id: draft.consumer_id,
            credential_id: draft.credential_id,
            server_id: draft.server_id,
            tool: draft.tool,
            args: draft.args,
            response,
            latency_ms: draft.latency_ms,
            status: draft.status,
            error: draft.error,
            prev_hash,
            hash: hash.clone(),
        };
        self.store.insert_audit(&entry)?;
        if self.chain {
            *last = hash;
        }
        drop(last);

        self.post_webhook(&entry);
        Ok(entry)
    }

    /// Fire-and-forget JSON POST of the entry; failures are swallowed.
    fn post_webhook(&self, entry: &AuditEntry) {
        let Some(url) = self.webhook_url.clone() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no async runtime; audit webhook skipped");
            return;
        };
        let request = self.client.post(url).json(entry);
        handle.spawn(async move {
            if let Err(e) = request.send().await {
                tracing::debug!(error = %e, "audit webhook delivery failed");
            }
        });
    }

    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.store.query_audit(filter)
    }

    pub fn stats(&self) -> Result<AuditStats> {
        self.store.stats()
    }

    /// Walk every row in insertion order, checking linkage and hash
    /// recomputation. The first failing row breaks the walk.
    pub fn verify(&self) -> Result<VerifyReport> {
        let rows = self.store.all_ordered()?;
        let mut expected_prev = GENESIS.to_string();
        for (index, row) in rows.iter().enumerate() {
            if let Some(prev) = &row.prev_hash {
                if *prev != expected_prev {
                    return Ok(VerifyReport::broken(&row.id, index as u64));
                }
            }
            if row.recompute_hash() != row.hash {
                return Ok(VerifyReport::broken(&row.id, index as u64));
            }
            expected_prev = row.hash.clone();
        }
        Ok(VerifyReport::ok(rows.len() as u64))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
