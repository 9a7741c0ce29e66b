//! Audit entry model and the hash chain over it.
//!
//! Every terminal call outcome becomes exactly one [`AuditEntry`]. Entries
//! are append-only; when chaining is enabled, each entry's `prev_hash`
//! carries the `hash` of the entry before it (the literal `"genesis"` for
//! the first), making after-the-fact edits detectable.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stored response payloads are cut at this many bytes. Part of the audit
/// contract, not an implementation detail.
pub const RESPONSE_BYTE_LIMIT: usize = 10_000;

/// Chain seed for the first entry of a log.
pub const GENESIS: &str = "genesis";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Terminal status of one gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditStatus {
    Success,
    Error,
    Denied,
    RateLimited,
}

impl AuditStatus {
    /// Canonical wire/storage form. This string participates in the hash
    /// composition, so it must never change for existing variants.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Error => "error",
            AuditStatus::Denied => "denied",
            AuditStatus::RateLimited => "rate-limited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AuditStatus::Success),
            "error" => Some(AuditStatus::Error),
            "denied" => Some(AuditStatus::Denied),
            "rate-limited" => Some(AuditStatus::RateLimited),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One row recording a terminal call outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    /// RFC 3339 UTC with millisecond precision. Stored as text so the
    /// hashed form and the persisted form are byte-identical.
    pub timestamp: String,
    pub consumer_id: String,
    pub credential_id: String,
    pub server_id: String,
    pub tool: String,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
    pub latency_ms: u64,
    pub status: AuditStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub prev_hash: Option<String>,
    pub hash: String,
}

impl AuditEntry {
    /// Recompute this entry's hash from its stored fields.
    pub fn recompute_hash(&self) -> String {
        canonical_hash(
            &self.id,
            &self.timestamp,
            &self.consumer_id,
            &self.server_id,
            &self.tool,
            self.status,
            self.prev_hash.as_deref(),
        )
    }
}

/// The canonical hash composition:
/// `sha256_hex(id|timestamp|consumer_id|server_id|tool|status|prev_hash)`.
///
/// An absent `prev_hash` (chain disabled) contributes the empty string.
pub fn canonical_hash(
    id: &str,
    timestamp: &str,
    consumer_id: &str,
    server_id: &str,
    tool: &str,
    status: AuditStatus,
    prev_hash: Option<&str>,
) -> String {
    let material = format!(
        "{id}|{timestamp}|{consumer_id}|{server_id}|{tool}|{status}|{prev}",
        status = status.as_str(),
        prev = prev_hash.unwrap_or(""),
    );
    let digest = Sha256::digest(material.as_bytes());
    hex::encode(digest)
}

/// Current instant in the audit timestamp format.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Cut a serialized payload at [`RESPONSE_BYTE_LIMIT`], backing off to the
/// nearest char boundary so the result stays valid UTF-8.
pub fn truncate_response(s: &str) -> String {
    if s.len() <= RESPONSE_BYTE_LIMIT {
        return s.to_string();
    }
    let mut end = RESPONSE_BYTE_LIMIT;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Query shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Equality + half-open time-range filters for `query`, with a cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    #[serde(default)]
    pub consumer_id: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub status: Option<AuditStatus>,
    /// Inclusive lower bound (RFC 3339).
    #[serde(default)]
    pub since: Option<String>,
    /// Exclusive upper bound (RFC 3339).
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// Aggregates over the whole log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    pub total: u64,
    pub by_status: HashMap<String, u64>,
    pub by_server: HashMap<String, u64>,
}

/// Outcome of a full-chain integrity walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    pub valid: bool,
    /// Id of the first entry failing linkage or recomputation.
    #[serde(default)]
    pub broken_at: Option<String>,
    /// How many entries were checked.
    pub checked: u64,
}

impl VerifyReport {
    pub fn ok(checked: u64) -> Self {
        Self {
            valid: true,
            broken_at: None,
            checked,
        }
    }

    pub fn broken(at: impl Into<String>, checked: u64) -> Self {
        Self {
            valid: false,
            broken_at: Some(at.into()),
            checked,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_canonical_form() {
        for status in [
            AuditStatus::Success,
            AuditStatus::Error,
            AuditStatus::Denied,
            AuditStatus::RateLimited,
        ] {
            assert_eq!(AuditStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AuditStatus::RateLimited.as_str(), "rate-limited");
    }

    #[test]
    fn status_serde_uses_kebab_case() {
        let json = serde_json::to_string(&AuditStatus::RateLimited).unwrap();
        assert_eq!(json, "\"rate-limited\"");
    }

    #[test]
    fn hash_is_deterministic_and_prev_sensitive() {
        let a = canonical_hash(
            "e1", "2025-01-01T00:00:00.000Z", "acme", "files", "read_file",
            AuditStatus::Success, Some(GENESIS),
        );
        let b = canonical_hash(
            "e1", "2025-01-01T00:00:00.000Z", "acme", "files", "read_file",
            AuditStatus::Success, Some(GENESIS),
        );
        let c = canonical_hash(
            "e1", "2025-01-01T00:00:00.000Z", "acme", "files", "read_file",
            AuditStatus::Success, Some("other"),
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn recompute_matches_construction() {
        let prev = GENESIS.to_string();
        let entry = AuditEntry {
            id: "e1".into(),
            timestamp: "2025-01-01T00:00:00.000Z".into(),
            consumer_id: "acme".into(),
            credential_id: "key-1".into(),
            server_id: "files".into(),
            tool: "read_file".into(),
            args: None,
            response: None,
            latency_ms: 12,
            status: AuditStatus::Success,
            error: None,
            prev_hash: Some(prev.clone()),
            hash: String::new(),
        };
        let expected = canonical_hash(
            "e1", "2025-01-01T00:00:00.000Z", "acme", "files", "read_file",
            AuditStatus::Success, Some(&prev),
        );
        assert_eq!(entry.recompute_hash(), expected);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(RESPONSE_BYTE_LIMIT); // 2 bytes per char
        let cut = truncate_response(&long);
        assert!(cut.len() <= RESPONSE_BYTE_LIMIT);
        assert!(cut.is_char_boundary(cut.len()));

        let short = "hello";
        assert_eq!(truncate_response(short), "hello");
    }

    #[test]
    fn now_timestamp_is_utc_millis() {
        let ts = now_timestamp();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('.'));
    }
}
