//! The gateway as a tool provider.
//!
//! Upstream clients speak the same line-delimited JSON-RPC dialect the
//! backends do. The gateway advertises its management surface as tools;
//! every result is a single-element `content` array carrying JSON text.
//! Requests are handled concurrently; a writer task serializes stdout.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use tg_domain::audit::AuditFilter;
use tg_domain::Result;
use tg_mcp::protocol::{error_response, ok_response, IncomingRequest, PROTOCOL_VERSION};

use crate::orchestrator::{CallOutcome, Gateway};

/// Serve the gateway over this process's stdin/stdout until EOF.
pub async fn serve_stdio(gateway: Arc<Gateway>) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        // Non-JSON lines are discarded per the wire contract.
        if trimmed.is_empty() || !trimmed.starts_with('{') {
            continue;
        }
        let request = match serde_json::from_str::<IncomingRequest>(trimmed) {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!(error = %e, "discarding unparseable inbound line");
                continue;
            }
        };
        let gateway = Arc::clone(&gateway);
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(response) = handle_request(&gateway, request).await {
                let _ = tx.send(response.to_string()).await;
            }
        });
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

/// Handle one inbound message. Notifications produce no response.
pub async fn handle_request(gateway: &Gateway, request: IncomingRequest) -> Option<Value> {
    let id = request.id?;
    let params = request.params.unwrap_or_else(|| json!({}));

    let response = match request.method.as_str() {
        "initialize" => ok_response(
            &id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "toolgate",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "tools/list" => ok_response(&id, json!({ "tools": meta_tools() })),
        "tools/call" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            let result = dispatch_tool(gateway, name, &arguments).await;
            ok_response(&id, result)
        }
        other => {
            tracing::debug!(method = %other, "unknown southbound method");
            error_response(&id, -32601, "Method not found")
        }
    };
    Some(response)
}

/// Route one `tools/call` to the management surface.
async fn dispatch_tool(gateway: &Gateway, name: &str, args: &Value) -> Value {
    match name {
        "call" => {
            let credential = args.get("credential").and_then(Value::as_str);
            let Some(ctx) = gateway.authenticate(credential).await else {
                return tool_error("authentication failed");
            };
            let Some(tool) = args.get("tool").and_then(Value::as_str) else {
                return tool_error("missing required parameter: tool");
            };
            let raw_args = args.get("args").and_then(Value::as_str).unwrap_or("{}");
            let tool_args: Value = match serde_json::from_str(raw_args) {
                Ok(v @ Value::Object(_)) => v,
                Ok(_) => return tool_error("args must be a JSON object"),
                Err(e) => return tool_error(&format!("args is not valid JSON: {e}")),
            };

            match gateway.call_tool(&ctx, tool, tool_args).await {
                Ok(CallOutcome::Success { result, .. }) => tool_result(&result),
                Ok(CallOutcome::Denied { reason }) => {
                    tool_error_json(&json!({ "denied": true, "reason": reason }))
                }
                Ok(CallOutcome::RateLimited { reset_at }) => {
                    tool_error_json(&json!({ "rateLimited": true, "resetAt": reset_at }))
                }
                Err(e) => tool_error(&e.to_string()),
            }
        }
        "list_tools" => {
            let credential = args.get("credential").and_then(Value::as_str);
            let Some(ctx) = gateway.authenticate(credential).await else {
                return tool_error("authentication failed");
            };
            tool_result(&gateway.list_tools(&ctx))
        }
        "list_servers" => {
            let servers: Vec<Value> = gateway
                .server_statuses()
                .into_iter()
                .map(|s| {
                    json!({
                        "id": s.id,
                        "name": s.name,
                        "status": s.status,
                        "toolCount": s.tool_count,
                    })
                })
                .collect();
            tool_result(&servers)
        }
        "server_status" => tool_result(&gateway.server_statuses()),
        "audit_log" => {
            let filter: AuditFilter = match serde_json::from_value(args.clone()) {
                Ok(f) => f,
                Err(e) => return tool_error(&format!("invalid filter: {e}")),
            };
            match gateway.audit_query(&filter) {
                Ok(entries) => tool_result(&entries),
                Err(e) => tool_error(&e.to_string()),
            }
        }
        "audit_verify" => match gateway.audit_verify() {
            Ok(report) => tool_result(&report),
            Err(e) => tool_error(&e.to_string()),
        },
        "audit_stats" => match gateway.audit_stats() {
            Ok(stats) => tool_result(&stats),
            Err(e) => tool_error(&e.to_string()),
        },
        "usage" => {
            let consumer = args.get("consumer").and_then(Value::as_str);
            match gateway.usage(consumer) {
                Ok(summary) => tool_result(&summary),
                Err(e) => tool_error(&e.to_string()),
            }
        }
        other => tool_error(&format!("unknown tool: {other}")),
    }
}

/// Wrap a serializable value as a single-element text content array.
fn tool_result<T: Serialize>(value: &T) -> Value {
    let text = serde_json::to_string(value)
        .unwrap_or_else(|e| format!("{{\"error\":\"serialization failed: {e}\"}}"));
    json!({ "content": [{ "type": "text", "text": text }] })
}

fn tool_error_json(value: &Value) -> Value {
    let mut result = tool_result(value);
    result["isError"] = json!(true);
    result
}

fn tool_error(message: &str) -> Value {
    tool_error_json(&json!({ "error": message }))
}

/// The management tool catalog advertised via `tools/list`.
fn meta_tools() -> Vec<Value> {
    vec![
        json!({
            "name": "call",
            "description": "Invoke a tool on a managed backend through the policy pipeline",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "tool": { "type": "string", "description": "Tool name" },
                    "args": { "type": "string", "description": "Tool arguments as a JSON object string" },
                    "credential": { "type": "string", "description": "Caller credential" }
                },
                "required": ["tool"]
            }
        }),
        json!({
            "name": "list_tools",
            "description": "List tools the caller is allowed to invoke",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "credential": { "type": "string" }
                }
            }
        }),
        json!({
            "name": "list_servers",
            "description": "List managed backends",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "server_status",
            "description": "Detailed status of every managed backend",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "audit_log",
            "description": "Query the audit log",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "consumer_id": { "type": "string" },
                    "server_id": { "type": "string" },
                    "tool": { "type": "string" },
                    "status": { "type": "string", "enum": ["success", "error", "denied", "rate-limited"] },
                    "since": { "type": "string" },
                    "until": { "type": "string" },
                    "limit": { "type": "integer" },
                    "offset": { "type": "integer" }
                }
            }
        }),
        json!({
            "name": "audit_verify",
            "description": "Verify the audit hash chain",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "audit_stats",
            "description": "Aggregate audit counters",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "usage",
            "description": "Usage summary, optionally for one consumer",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "consumer": { "type": "string" }
                }
            }
        }),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
