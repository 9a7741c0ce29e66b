//! The ToolGate configuration document.
//!
//! A single YAML or JSON file with top-level keys `auth`, `servers`,
//! `policies`, `audit`, `metering`, `rateLimit`, and optional `host`/`port`
//! (used by HTTP wrappers layered on top of the core). Wire names are
//! camelCase.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level document
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub audit: Option<AuditConfig>,
    #[serde(default)]
    pub metering: MeteringConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl GatewayConfig {
    /// Load a document from disk, choosing the parser by extension
    /// (`.json` → JSON, anything else → YAML), then validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: GatewayConfig = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&raw)?
        } else {
            serde_yaml::from_str(&raw)
                .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde enforces. All problems are
    /// reported at once, joined into one message.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.auth.is_none() {
            problems.push("auth section is required".to_string());
        }
        if self.audit.is_none() {
            problems.push("audit section is required".to_string());
        }
        if self.policies.is_empty() {
            problems.push("at least one policy is required".to_string());
        }

        let mut seen_servers = std::collections::HashSet::new();
        for server in &self.servers {
            if !seen_servers.insert(server.id.as_str()) {
                problems.push(format!("duplicate server id: {}", server.id));
            }
            if server.command.is_empty() {
                problems.push(format!("server {}: command is required", server.id));
            }
        }

        let mut seen_policies = std::collections::HashSet::new();
        for policy in &self.policies {
            if !seen_policies.insert(policy.id.as_str()) {
                problems.push(format!("duplicate policy id: {}", policy.id));
            }
        }

        if let Some(auth) = &self.auth {
            for (idx, cred) in auth.credentials.iter().enumerate() {
                if cred.id.is_empty() {
                    problems.push(format!("credential #{idx}: id is required"));
                }
                if cred.key.is_empty() {
                    problems.push(format!("credential #{idx}: key is required"));
                }
                if cred.consumer_id.is_empty() {
                    problems.push(format!("credential #{idx}: consumerId is required"));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    /// Look up a server descriptor by id.
    pub fn server(&self, id: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.id == id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Authentication
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    /// Pre-shared credentials (mode `api_key`).
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
    /// Token verification settings (modes `jwt` and `oidc`).
    #[serde(default)]
    pub token: Option<TokenAuthConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Every caller resolves to the anonymous context.
    #[default]
    None,
    /// Pre-shared keys looked up verbatim or by SHA-256 hex.
    ApiKey,
    /// Signed token verified against a configured secret or public key.
    Jwt,
    /// Signed token whose key is discovered from a JWKS endpoint.
    Oidc,
}

/// One pre-shared credential record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialConfig {
    #[serde(default)]
    pub id: String,
    /// The credential itself — either the raw value or its SHA-256 hex.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub consumer_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "d_true")]
    pub enabled: bool,
}

/// Settings shared by the `jwt` and `oidc` modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenAuthConfig {
    /// HS256 shared secret.
    #[serde(default)]
    pub secret: Option<String>,
    /// RS256 public key, PEM form.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    /// Claim carrying the consumer id.
    #[serde(default = "d_sub")]
    pub consumer_claim: String,
    /// Claim carrying roles (scalar or array).
    #[serde(default = "d_roles")]
    pub roles_claim: String,
    /// Explicit JWKS endpoint. When absent in `oidc` mode, derived from
    /// `issuer` + `/.well-known/jwks.json`.
    #[serde(default)]
    pub jwks_url: Option<String>,
    /// When non-empty, tokens carrying an email claim must match one of
    /// these domains.
    #[serde(default)]
    pub allowed_email_domains: Vec<String>,
}

impl Default for TokenAuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            public_key: None,
            issuer: None,
            audience: None,
            consumer_claim: d_sub(),
            roles_claim: d_roles(),
            jwks_url: None,
            allowed_email_domains: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Descriptor of one managed backend process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overlaid on the gateway's own environment at spawn.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Per-call proxy deadline.
    #[serde(default = "d_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub health_check: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A role-scoped rule set, evaluated per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Roles this policy applies to. `*` matches any caller.
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// One allow/deny clause. Absent globs count as `*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    pub action: RuleAction,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

/// Argument condition attached to a rule. All conditions on a rule must
/// hold for the rule to match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub param: String,
    pub op: ConditionOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOp {
    Eq,
    Neq,
    In,
    Regex,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Audit / metering / rate limit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_db_path")]
    pub db_path: String,
    /// Hash-chain entries so tampering is detectable.
    #[serde(default = "d_true")]
    pub chain: bool,
    /// Fire-and-forget JSON POST per entry, when set.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: d_db_path(),
            chain: true,
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeteringConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Background rollup cadence, seconds.
    #[serde(default = "d_60")]
    pub flush_interval_secs: u64,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Default per-minute limit; credentials may override per caller.
    #[serde(default = "d_60u32")]
    pub per_minute: u32,
    /// Admission cap = `ceil(limit × burstMultiplier)`.
    #[serde(default = "d_burst")]
    pub burst_multiplier: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_minute: 60,
            burst_multiplier: 2.0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serde defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_true() -> bool {
    true
}

fn d_timeout_ms() -> u64 {
    30_000
}

fn d_db_path() -> String {
    "./data/toolgate.db".into()
}

fn d_60() -> u64 {
    60
}

fn d_60u32() -> u32 {
    60
}

fn d_burst() -> f64 {
    2.0
}

fn d_sub() -> String {
    "sub".into()
}

fn d_roles() -> String {
    "roles".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
