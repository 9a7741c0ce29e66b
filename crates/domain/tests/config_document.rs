use std::io::Write;

use tg_domain::config::{AuthMode, GatewayConfig};

const DOC_YAML: &str = r#"
auth:
  mode: api_key
  credentials:
    - id: key-1
      key: sekrit
      consumerId: acme
      roles: [reader]
audit:
  dbPath: "./data/audit.db"
  chain: true
metering:
  enabled: true
rateLimit:
  perMinute: 30
  burstMultiplier: 1.5
policies:
  - id: readers
    roles: [reader]
    rules:
      - tool: "get_*"
        action: allow
      - tool: "*"
        action: deny
servers:
  - id: files
    command: "node"
    args: ["files-server.js"]
    env:
      API_TOKEN: "abc"
    timeoutMs: 10000
host: 127.0.0.1
port: 8080
"#;

#[test]
fn loads_yaml_document_from_disk() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write!(file, "{DOC_YAML}").unwrap();

    let config = GatewayConfig::load(file.path()).unwrap();
    let auth = config.auth.as_ref().unwrap();
    assert_eq!(auth.mode, AuthMode::ApiKey);
    assert_eq!(auth.credentials[0].consumer_id, "acme");
    assert_eq!(config.rate_limit.per_minute, 30);
    assert_eq!(config.servers[0].env["API_TOKEN"], "abc");
    assert_eq!(config.servers[0].timeout_ms, 10_000);
    assert_eq!(config.port, Some(8080));
    assert_eq!(config.server("files").unwrap().command, "node");
    assert!(config.server("ghost").is_none());
}

#[test]
fn loads_equivalent_json_document() {
    let yaml: serde_yaml::Value = serde_yaml::from_str(DOC_YAML).unwrap();
    let json = serde_json::to_string(&yaml).unwrap();

    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(file, "{json}").unwrap();

    let config = GatewayConfig::load(file.path()).unwrap();
    assert_eq!(config.policies.len(), 1);
    assert_eq!(config.policies[0].rules.len(), 2);
}

#[test]
fn load_rejects_invalid_documents() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    // Parses fine, but has no policies and no audit section.
    write!(file, "auth:\n  mode: none\n").unwrap();

    let err = GatewayConfig::load(file.path()).unwrap_err().to_string();
    assert!(err.contains("audit section is required"));
    assert!(err.contains("at least one policy is required"));
}
