use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resolved caller identity, produced by the authenticator.
///
/// Immutable for the lifetime of one call; nothing downstream of
/// authentication mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerContext {
    /// Billing/audit subject behind the credential.
    pub consumer_id: String,
    /// Which credential authenticated this call.
    pub credential_id: String,
    /// Free-form role labels used to select policies.
    pub roles: Vec<String>,
    /// Per-caller rate override (requests per minute), if configured.
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub email: Option<String>,
    /// Opaque metadata carried through from the credential source.
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl CallerContext {
    /// The context handed out when authentication is disabled.
    pub fn anonymous() -> Self {
        Self {
            consumer_id: "anonymous".into(),
            credential_id: "none".into(),
            roles: vec!["*".into()],
            rate_limit_per_minute: None,
            email: None,
            metadata: None,
        }
    }

    /// Whether the caller carries the given role (or the wildcard).
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role || r == "*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_context_has_wildcard_role() {
        let ctx = CallerContext::anonymous();
        assert_eq!(ctx.consumer_id, "anonymous");
        assert_eq!(ctx.credential_id, "none");
        assert!(ctx.has_role("anything"));
    }

    #[test]
    fn has_role_matches_exact() {
        let ctx = CallerContext {
            consumer_id: "acme".into(),
            credential_id: "key-1".into(),
            roles: vec!["reader".into()],
            rate_limit_per_minute: None,
            email: None,
            metadata: None,
        };
        assert!(ctx.has_role("reader"));
        assert!(!ctx.has_role("admin"));
    }
}
