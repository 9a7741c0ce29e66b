//! The per-call pipeline.
//!
//! `call_tool` composes locate → policy → rate limit → proxy, writing
//! exactly one audit entry on every terminal path and metering the calls
//! that reached a backend. Denials and rate limits are structured results,
//! not errors; failures carry the taxonomy from `tg_domain::Error`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use tg_domain::audit::{AuditFilter, AuditStats, AuditStatus, VerifyReport};
use tg_domain::config::GatewayConfig;
use tg_domain::usage::UsageSummary;
use tg_domain::{CallerContext, Error, Result};
use tg_mcp::protocol::ToolDef;
use tg_mcp::registry::{ServerRegistry, ServerStatusReport};

use crate::audit::{AuditDraft, AuditLog};
use crate::auth::Authenticator;
use crate::meter::Meter;
use crate::policy::PolicyEngine;
use crate::ratelimit::RateLimiter;
use crate::store::{GatewayStore, SqliteStore};

/// Terminal result of one proxied call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum CallOutcome {
    Success {
        result: Value,
        latency_ms: u64,
    },
    Denied {
        reason: String,
    },
    RateLimited {
        reset_at: DateTime<Utc>,
    },
}

/// One advertised tool, policy-filtered for a caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub server_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// The gateway core: every collaborator behind one handle.
pub struct Gateway {
    auth: Authenticator,
    policy: PolicyEngine,
    limiter: RateLimiter,
    registry: ServerRegistry,
    audit: AuditLog,
    meter: Arc<Meter>,
    store: Arc<dyn GatewayStore>,
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Gateway {
    /// Wire the pipeline from a validated configuration document.
    pub fn build(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let auth_config = config
            .auth
            .as_ref()
            .ok_or_else(|| Error::Config("auth section is required".into()))?;
        let audit_config = config
            .audit
            .as_ref()
            .ok_or_else(|| Error::Config("audit section is required".into()))?;

        let store: Arc<dyn GatewayStore> = Arc::new(SqliteStore::open(&audit_config.db_path)?);
        let audit = AuditLog::new(audit_config, Arc::clone(&store))?;
        let meter = Arc::new(Meter::new(&config.metering, Arc::clone(&store)));

        Ok(Self {
            auth: Authenticator::new(auth_config)?,
            policy: PolicyEngine::new(&config.policies),
            limiter: RateLimiter::new(config.rate_limit.clone()),
            registry: ServerRegistry::new(config.servers.clone()),
            audit,
            meter,
            store,
            flush_task: Mutex::new(None),
        })
    }

    /// Start the backend fleet and the metering flush task.
    pub async fn start(&self) {
        self.registry.start_all().await;
        *self.flush_task.lock() = Some(self.meter.spawn_flush_task());
    }

    /// Drain backends, flush counters, and release the store.
    pub async fn shutdown(&self) {
        self.registry.stop_all().await;
        if let Some(task) = self.flush_task.lock().take() {
            task.abort();
        }
        self.meter.flush();
        if let Err(e) = self.store.close() {
            tracing::warn!(error = %e, "store close failed");
        }
        tracing::info!("gateway shut down");
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Resolve a credential; `None` when the caller cannot be identified.
    pub async fn authenticate(&self, credential: Option<&str>) -> Option<CallerContext> {
        self.auth.authenticate(credential).await
    }

    /// Hot-reload hook: atomically swap credentials and policies.
    pub fn reload(&self, config: &GatewayConfig) {
        if let Some(auth) = &config.auth {
            self.auth.reload(auth);
        }
        self.policy.reload(&config.policies);
    }

    /// Run one tool call through the full pipeline.
    pub async fn call_tool(
        &self,
        ctx: &CallerContext,
        tool: &str,
        args: Value,
    ) -> Result<CallOutcome> {
        let args_text = serde_json::to_string(&args).ok();

        // 1. Locate the owning backend.
        let Some(server_id) = self.registry.find_server_for_tool(tool) else {
            self.audit.log(AuditDraft {
                consumer_id: ctx.consumer_id.clone(),
                credential_id: ctx.credential_id.clone(),
                server_id: "unknown".into(),
                tool: tool.into(),
                args: args_text,
                response: None,
                latency_ms: 0,
                status: AuditStatus::Error,
                error: Some("Tool not found".into()),
            })?;
            return Err(Error::NotFound(tool.into()));
        };

        // 2. Policy. A denial mutates nothing downstream.
        let decision = self.policy.evaluate(ctx, &server_id, tool, &args);
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_else(|| "Denied".into());
            self.audit.log(AuditDraft {
                consumer_id: ctx.consumer_id.clone(),
                credential_id: ctx.credential_id.clone(),
                server_id: server_id.clone(),
                tool: tool.into(),
                args: args_text,
                response: None,
                latency_ms: 0,
                status: AuditStatus::Denied,
                error: Some(reason.clone()),
            })?;
            return Ok(CallOutcome::Denied { reason });
        }

        // 3. Rate limit on (consumer, server), honoring caller overrides.
        let rate_key = format!("{}:{}", ctx.consumer_id, server_id);
        let rate = self.limiter.check(&rate_key, ctx.rate_limit_per_minute);
        if !rate.allowed {
            self.audit.log(AuditDraft {
                consumer_id: ctx.consumer_id.clone(),
                credential_id: ctx.credential_id.clone(),
                server_id: server_id.clone(),
                tool: tool.into(),
                args: args_text,
                response: None,
                latency_ms: 0,
                status: AuditStatus::RateLimited,
                error: Some("Rate limit exceeded".into()),
            })?;
            return Ok(CallOutcome::RateLimited {
                reset_at: rate.reset_at,
            });
        }

        // 4. Proxy, with wall-clock latency.
        let timeout = self.registry.timeout_for(&server_id);
        let started = std::time::Instant::now();
        let result = match self.registry.proxy(&server_id) {
            Ok(proxy) => proxy
                .call_tool(tool, args, timeout)
                .await
                .map_err(Error::from),
            Err(e) => Err(e),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                self.audit.log(AuditDraft {
                    consumer_id: ctx.consumer_id.clone(),
                    credential_id: ctx.credential_id.clone(),
                    server_id: server_id.clone(),
                    tool: tool.into(),
                    args: args_text,
                    response: serde_json::to_string(&value).ok(),
                    latency_ms,
                    status: AuditStatus::Success,
                    error: None,
                })?;
                self.meter
                    .record(&ctx.consumer_id, &server_id, tool, latency_ms, false);
                Ok(CallOutcome::Success {
                    result: value,
                    latency_ms,
                })
            }
            Err(e) => {
                self.audit.log(AuditDraft {
                    consumer_id: ctx.consumer_id.clone(),
                    credential_id: ctx.credential_id.clone(),
                    server_id: server_id.clone(),
                    tool: tool.into(),
                    args: args_text,
                    response: None,
                    latency_ms,
                    status: AuditStatus::Error,
                    error: Some(e.to_string()),
                })?;
                self.meter
                    .record(&ctx.consumer_id, &server_id, tool, latency_ms, true);
                Err(e)
            }
        }
    }

    /// Tools of running backends the caller is allowed to invoke.
    ///
    /// Filtering evaluates each tool with empty arguments, so rules gated
    /// on argument conditions do not admit tools into the listing.
    pub fn list_tools(&self, ctx: &CallerContext) -> Vec<ToolInfo> {
        let empty = Value::Object(Default::default());
        self.registry
            .tools()
            .into_iter()
            .filter(|(server_id, tool)| {
                self.policy.evaluate(ctx, server_id, &tool.name, &empty).allowed
            })
            .map(|(server_id, tool)| {
                let ToolDef {
                    name,
                    description,
                    input_schema,
                } = tool;
                ToolInfo {
                    server_id,
                    name,
                    description,
                    input_schema,
                }
            })
            .collect()
    }

    pub fn server_statuses(&self) -> Vec<ServerStatusReport> {
        self.registry.statuses()
    }

    pub fn audit_query(&self, filter: &AuditFilter) -> Result<Vec<tg_domain::audit::AuditEntry>> {
        self.audit.query(filter)
    }

    pub fn audit_verify(&self) -> Result<VerifyReport> {
        self.audit.verify()
    }

    pub fn audit_stats(&self) -> Result<AuditStats> {
        self.audit.stats()
    }

    pub fn usage(&self, consumer_id: Option<&str>) -> Result<UsageSummary> {
        self.meter.summary(consumer_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
