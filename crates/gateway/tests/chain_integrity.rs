//! End-to-end audit chain integrity: entries logged through the gateway
//! pipeline chain from genesis, and editing a persisted row breaks
//! verification at exactly that row.

use std::sync::Arc;

use serde_json::json;

use tg_domain::audit::{AuditFilter, AuditStatus};
use tg_domain::config::{
    AuditConfig, AuthConfig, GatewayConfig, Policy, Rule, RuleAction, ServerConfig,
};
use tg_domain::CallerContext;
use tg_gateway::Gateway;

fn config(db_path: &str) -> GatewayConfig {
    GatewayConfig {
        auth: Some(AuthConfig::default()),
        servers: vec![ServerConfig {
            id: "files".into(),
            name: String::new(),
            command: "./files-server".into(),
            args: vec![],
            env: Default::default(),
            tags: vec![],
            enabled: true,
            timeout_ms: 1000,
            health_check: false,
        }],
        policies: vec![Policy {
            id: "split".into(),
            name: String::new(),
            roles: vec!["*".into()],
            rules: vec![
                Rule {
                    server: None,
                    tool: Some("get_*".into()),
                    action: RuleAction::Allow,
                    conditions: vec![],
                },
                Rule {
                    server: None,
                    tool: Some("*".into()),
                    action: RuleAction::Deny,
                    conditions: vec![],
                },
            ],
        }],
        audit: Some(AuditConfig {
            enabled: true,
            db_path: db_path.into(),
            chain: true,
            webhook_url: None,
        }),
        metering: Default::default(),
        rate_limit: Default::default(),
        host: None,
        port: None,
    }
}

fn caller() -> CallerContext {
    CallerContext {
        consumer_id: "acme".into(),
        credential_id: "key-1".into(),
        roles: vec!["reader".into()],
        rate_limit_per_minute: None,
        email: None,
        metadata: None,
    }
}

fn register_tools(gateway: &Gateway) {
    gateway
        .registry()
        .register_tools(
            "files",
            vec![
                tg_mcp::protocol::ToolDef {
                    name: "get_series".into(),
                    description: None,
                    input_schema: None,
                },
                tg_mcp::protocol::ToolDef {
                    name: "delete_x".into(),
                    description: None,
                    input_schema: None,
                },
            ],
        )
        .unwrap();
}

#[tokio::test]
async fn pipeline_entries_chain_and_tampering_is_localized() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("audit.db");
    let db_path = db_path.to_str().unwrap();

    let gateway = Arc::new(Gateway::build(config(db_path)).unwrap());
    register_tools(&gateway);
    let ctx = caller();

    // Three terminal outcomes: error (backend down), denied, error.
    let _ = gateway.call_tool(&ctx, "get_series", json!({"q": 1})).await;
    let _ = gateway.call_tool(&ctx, "delete_x", json!({})).await;
    let _ = gateway.call_tool(&ctx, "get_series", json!({"q": 2})).await;

    let entries = gateway.audit_query(&AuditFilter::default()).unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().any(|e| e.status == AuditStatus::Denied));

    let report = gateway.audit_verify().unwrap();
    assert!(report.valid, "untouched chain must verify");
    assert_eq!(report.checked, 3);

    // Tamper with the middle row out-of-band, touching a hashed field.
    let victim_id = {
        let conn = rusqlite::Connection::open(db_path).unwrap();
        let id: String = conn
            .query_row(
                "SELECT id FROM audit_log ORDER BY rowid LIMIT 1 OFFSET 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        conn.execute(
            "UPDATE audit_log SET tool = 'delete_everything' WHERE id = ?1",
            [&id],
        )
        .unwrap();
        id
    };

    let report = gateway.audit_verify().unwrap();
    assert!(!report.valid);
    assert_eq!(report.broken_at.as_deref(), Some(victim_id.as_str()));
}

#[tokio::test]
async fn chain_continues_across_gateway_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("audit.db");
    let db_path = db_path.to_str().unwrap();
    let ctx = caller();

    {
        let gateway = Gateway::build(config(db_path)).unwrap();
        register_tools(&gateway);
        let _ = gateway.call_tool(&ctx, "delete_x", json!({})).await;
        gateway.shutdown().await;
    }

    // A fresh gateway over the same store reseeds last-hash from disk.
    let gateway = Gateway::build(config(db_path)).unwrap();
    register_tools(&gateway);
    let _ = gateway.call_tool(&ctx, "delete_x", json!({})).await;

    let report = gateway.audit_verify().unwrap();
    assert!(report.valid);
    assert_eq!(report.checked, 2);

    let entries = gateway.audit_query(&AuditFilter::default()).unwrap();
    // Newest first: its prev_hash is the older entry's hash.
    assert_eq!(
        entries[0].prev_hash.as_deref(),
        Some(entries[1].hash.as_str())
    );
}
