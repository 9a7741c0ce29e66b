//! Default-deny, role-based policy evaluation.
//!
//! Rules are collected from every policy whose roles intersect the
//! caller's, filtered by server/tool globs, stable-sorted by specificity
//! (most specific first), and walked until one matches. Argument conditions
//! must all hold for a rule to match; the terminal fallback is deny.
//!
//! Glob semantics: `*` matches everything, `PREFIX*` is a prefix match,
//! `*SUFFIX` is a suffix match, anything else is equality. An absent glob
//! counts as `*`.

use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use tg_domain::config::{Condition, ConditionOp, Policy, Rule, RuleAction};
use tg_domain::CallerContext;

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// `policy-id#rule-index` of the deciding rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
}

impl PolicyDecision {
    fn allow(rule: &CompiledRule) -> Self {
        Self {
            allowed: true,
            reason: None,
            matched_rule: Some(rule.label.clone()),
        }
    }

    fn deny(rule: &CompiledRule) -> Self {
        Self {
            allowed: false,
            reason: Some(format!("Denied by policy {} ({})", rule.policy_id, rule.label)),
            matched_rule: Some(rule.label.clone()),
        }
    }

    fn default_deny() -> Self {
        Self {
            allowed: false,
            reason: Some("No matching rule".into()),
            matched_rule: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compiled form
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CompiledCondition {
    param: String,
    op: ConditionOp,
    value: Value,
    /// Compiled pattern for `regex` conditions; `None` means the pattern
    /// failed to compile and the condition fails closed.
    regex: Option<Regex>,
}

impl CompiledCondition {
    fn new(condition: &Condition) -> Self {
        let regex = if condition.op == ConditionOp::Regex {
            let pattern = coerce(&condition.value);
            match Regex::new(&pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "invalid condition regex; fails closed");
                    None
                }
            }
        } else {
            None
        };
        Self {
            param: condition.param.clone(),
            op: condition.op,
            value: condition.value.clone(),
            regex,
        }
    }

    /// Whether this condition holds for the given arguments. A parameter
    /// absent from the arguments fails regardless of operator.
    fn matches(&self, args: &Value) -> bool {
        let Some(actual) = args.get(&self.param) else {
            return false;
        };
        let actual = coerce(actual);
        match self.op {
            ConditionOp::Eq => actual == coerce(&self.value),
            ConditionOp::Neq => actual != coerce(&self.value),
            ConditionOp::In => match &self.value {
                Value::Array(items) => items.iter().any(|v| coerce(v) == actual),
                _ => false,
            },
            ConditionOp::Regex => match &self.regex {
                Some(re) => re.is_match(&actual),
                None => false,
            },
        }
    }
}

struct CompiledRule {
    policy_id: String,
    /// `policy-id#rule-index`, used in reasons and decision reporting.
    label: String,
    server: Option<String>,
    tool: Option<String>,
    action: RuleAction,
    conditions: Vec<CompiledCondition>,
    specificity: u8,
}

impl CompiledRule {
    fn new(policy_id: &str, index: usize, rule: &Rule) -> Self {
        let specificity = glob_weight(rule.server.as_deref()) + glob_weight(rule.tool.as_deref());
        Self {
            policy_id: policy_id.to_string(),
            label: format!("{policy_id}#{index}"),
            server: rule.server.clone(),
            tool: rule.tool.clone(),
            action: rule.action,
            conditions: rule.conditions.iter().map(CompiledCondition::new).collect(),
            specificity,
        }
    }

    fn in_scope(&self, server_id: &str, tool: &str) -> bool {
        glob_match(self.server.as_deref().unwrap_or("*"), server_id)
            && glob_match(self.tool.as_deref().unwrap_or("*"), tool)
    }
}

struct CompiledPolicy {
    roles: Vec<String>,
    rules: Vec<CompiledRule>,
}

impl CompiledPolicy {
    /// A policy applies when its roles intersect the caller's. A `*` policy
    /// role matches any caller that carries at least one role; a `*` caller
    /// role matches any policy. An empty caller role set matches nothing.
    fn applies_to(&self, ctx: &CallerContext) -> bool {
        if ctx.roles.is_empty() {
            return false;
        }
        self.roles.iter().any(|policy_role| {
            policy_role == "*" || ctx.roles.iter().any(|r| r == policy_role || r == "*")
        })
    }
}

fn compile(policies: &[Policy]) -> Vec<CompiledPolicy> {
    policies
        .iter()
        .map(|p| CompiledPolicy {
            roles: p.roles.clone(),
            rules: p
                .rules
                .iter()
                .enumerate()
                .map(|(i, r)| CompiledRule::new(&p.id, i, r))
                .collect(),
        })
        .collect()
}

fn glob_weight(pattern: Option<&str>) -> u8 {
    match pattern {
        Some(p) if p != "*" => 1,
        _ => 0,
    }
}

fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return value.ends_with(suffix);
    }
    pattern == value
}

/// String coercion used for condition comparison: strings compare as-is,
/// everything else by its JSON rendering.
fn coerce(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Evaluates rules against calls. The compiled rule set is an atomically
/// swappable snapshot so hot reload never mutates a set mid-evaluation.
pub struct PolicyEngine {
    compiled: RwLock<Arc<Vec<CompiledPolicy>>>,
}

impl PolicyEngine {
    pub fn new(policies: &[Policy]) -> Self {
        Self {
            compiled: RwLock::new(Arc::new(compile(policies))),
        }
    }

    /// Atomically replace the rule set (hot reload).
    pub fn reload(&self, policies: &[Policy]) {
        *self.compiled.write() = Arc::new(compile(policies));
        tracing::info!(policies = policies.len(), "policy set reloaded");
    }

    /// Decide one call.
    pub fn evaluate(
        &self,
        ctx: &CallerContext,
        server_id: &str,
        tool: &str,
        args: &Value,
    ) -> PolicyDecision {
        let compiled = Arc::clone(&self.compiled.read());

        let mut candidates: Vec<&CompiledRule> = compiled
            .iter()
            .filter(|p| p.applies_to(ctx))
            .flat_map(|p| p.rules.iter())
            .filter(|r| r.in_scope(server_id, tool))
            .collect();

        // Stable: equal specificity keeps policy order, then rule order.
        candidates.sort_by_key(|r| std::cmp::Reverse(r.specificity));

        for rule in candidates {
            if !rule.conditions.iter().all(|c| c.matches(args)) {
                continue;
            }
            let decision = match rule.action {
                RuleAction::Allow => PolicyDecision::allow(rule),
                RuleAction::Deny => PolicyDecision::deny(rule),
            };
            tracing::debug!(
                consumer_id = %ctx.consumer_id,
                server_id,
                tool,
                rule = %rule.label,
                allowed = decision.allowed,
                "policy decision"
            );
            return decision;
        }

        PolicyDecision::default_deny()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(roles: &[&str]) -> CallerContext {
        CallerContext {
            consumer_id: "acme".into(),
            credential_id: "key-1".into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            rate_limit_per_minute: None,
            email: None,
            metadata: None,
        }
    }

    fn rule(server: Option<&str>, tool: Option<&str>, action: RuleAction) -> Rule {
        Rule {
            server: server.map(str::to_string),
            tool: tool.map(str::to_string),
            action,
            conditions: vec![],
        }
    }

    fn policy(id: &str, roles: &[&str], rules: Vec<Rule>) -> Policy {
        Policy {
            id: id.into(),
            name: id.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            rules,
        }
    }

    #[test]
    fn reader_prefix_allow_with_wildcard_deny() {
        let engine = PolicyEngine::new(&[policy(
            "readers",
            &["reader"],
            vec![
                rule(None, Some("get_*"), RuleAction::Allow),
                rule(None, Some("*"), RuleAction::Deny),
            ],
        )]);
        let caller = ctx(&["reader"]);

        let allowed = engine.evaluate(&caller, "server-a", "get_series", &json!({}));
        assert!(allowed.allowed);
        assert_eq!(allowed.matched_rule.as_deref(), Some("readers#0"));

        let denied = engine.evaluate(&caller, "server-a", "delete_x", &json!({}));
        assert!(!denied.allowed);
        // The reason names the deciding wildcard rule.
        assert!(denied.reason.as_deref().unwrap().contains("readers#1"));
    }

    #[test]
    fn admin_single_allow_rule_grants_everything() {
        let engine = PolicyEngine::new(&[policy(
            "admins",
            &["admin"],
            vec![rule(None, None, RuleAction::Allow)],
        )]);
        let decision = engine.evaluate(&ctx(&["admin"]), "anywhere", "delete_anything", &json!({}));
        assert!(decision.allowed);
    }

    #[test]
    fn server_specific_deny_beats_wildcard_allow() {
        let engine = PolicyEngine::new(&[
            policy(
                "readers",
                &["reader"],
                vec![rule(None, Some("*"), RuleAction::Allow)],
            ),
            policy(
                "pay-lockdown",
                &["reader"],
                vec![rule(Some("pay"), Some("*"), RuleAction::Deny)],
            ),
        ]);
        let caller = ctx(&["reader"]);

        // Specificity 1 (server set) beats specificity 0.
        let denied = engine.evaluate(&caller, "pay", "get_x", &json!({}));
        assert!(!denied.allowed);
        assert!(denied.reason.as_deref().unwrap().contains("pay-lockdown"));

        // Other servers still fall through to the wildcard allow.
        assert!(engine.evaluate(&caller, "files", "get_x", &json!({})).allowed);
    }

    #[test]
    fn empty_role_set_is_always_denied() {
        let engine = PolicyEngine::new(&[policy(
            "open",
            &["*"],
            vec![rule(None, None, RuleAction::Allow)],
        )]);
        let decision = engine.evaluate(&ctx(&[]), "files", "anything", &json!({}));
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("No matching rule"));
    }

    #[test]
    fn wildcard_policy_role_matches_any_caller_with_roles() {
        let engine = PolicyEngine::new(&[policy(
            "open",
            &["*"],
            vec![rule(None, None, RuleAction::Allow)],
        )]);
        assert!(engine.evaluate(&ctx(&["whatever"]), "s", "t", &json!({})).allowed);
    }

    #[test]
    fn wildcard_caller_role_matches_any_policy() {
        let engine = PolicyEngine::new(&[policy(
            "admins",
            &["admin"],
            vec![rule(None, None, RuleAction::Allow)],
        )]);
        // The anonymous context carries the wildcard role.
        assert!(engine
            .evaluate(&CallerContext::anonymous(), "s", "t", &json!({}))
            .allowed);
    }

    #[test]
    fn no_policies_for_role_defaults_to_deny() {
        let engine = PolicyEngine::new(&[policy(
            "admins",
            &["admin"],
            vec![rule(None, None, RuleAction::Allow)],
        )]);
        let decision = engine.evaluate(&ctx(&["reader"]), "s", "t", &json!({}));
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("No matching rule"));
    }

    #[test]
    fn equal_specificity_keeps_configuration_order() {
        // Two rules, both specificity 1, both matching: walk order decides.
        let deny_first = PolicyEngine::new(&[policy(
            "p",
            &["reader"],
            vec![
                rule(None, Some("get_*"), RuleAction::Deny),
                rule(None, Some("get_*"), RuleAction::Allow),
            ],
        )]);
        assert!(!deny_first.evaluate(&ctx(&["reader"]), "s", "get_x", &json!({})).allowed);

        let allow_first = PolicyEngine::new(&[policy(
            "p",
            &["reader"],
            vec![
                rule(None, Some("get_*"), RuleAction::Allow),
                rule(None, Some("get_*"), RuleAction::Deny),
            ],
        )]);
        assert!(allow_first.evaluate(&ctx(&["reader"]), "s", "get_x", &json!({})).allowed);
    }

    #[test]
    fn suffix_glob_and_equality() {
        let engine = PolicyEngine::new(&[policy(
            "p",
            &["reader"],
            vec![
                rule(None, Some("*_secret"), RuleAction::Deny),
                rule(None, Some("exact_tool"), RuleAction::Allow),
            ],
        )]);
        let caller = ctx(&["reader"]);
        assert!(!engine.evaluate(&caller, "s", "read_secret", &json!({})).allowed);
        assert!(engine.evaluate(&caller, "s", "exact_tool", &json!({})).allowed);
        // Unmatched tool falls through to default deny.
        assert!(!engine.evaluate(&caller, "s", "other", &json!({})).allowed);
    }

    #[test]
    fn conditions_gate_rule_matching() {
        let engine = PolicyEngine::new(&[policy(
            "p",
            &["reader"],
            vec![
                Rule {
                    server: None,
                    tool: Some("query".into()),
                    action: RuleAction::Allow,
                    conditions: vec![Condition {
                        param: "db".into(),
                        op: ConditionOp::Eq,
                        value: json!("analytics"),
                    }],
                },
                rule(None, Some("query"), RuleAction::Deny),
            ],
        )]);
        let caller = ctx(&["reader"]);

        assert!(engine
            .evaluate(&caller, "s", "query", &json!({"db": "analytics"}))
            .allowed);
        // Wrong value: the conditioned rule is skipped, the deny matches.
        assert!(!engine
            .evaluate(&caller, "s", "query", &json!({"db": "prod"}))
            .allowed);
        // Absent parameter fails the condition.
        assert!(!engine.evaluate(&caller, "s", "query", &json!({})).allowed);
    }

    #[test]
    fn condition_operators() {
        let caller = ctx(&["reader"]);
        let engine_for = |op: ConditionOp, value: Value| {
            PolicyEngine::new(&[policy(
                "p",
                &["reader"],
                vec![Rule {
                    server: None,
                    tool: None,
                    action: RuleAction::Allow,
                    conditions: vec![Condition {
                        param: "x".into(),
                        op,
                        value,
                    }],
                }],
            )])
        };

        let neq = engine_for(ConditionOp::Neq, json!("a"));
        assert!(neq.evaluate(&caller, "s", "t", &json!({"x": "b"})).allowed);
        assert!(!neq.evaluate(&caller, "s", "t", &json!({"x": "a"})).allowed);
        // Absent parameter fails even for neq.
        assert!(!neq.evaluate(&caller, "s", "t", &json!({})).allowed);

        let contains = engine_for(ConditionOp::In, json!(["a", "b"]));
        assert!(contains.evaluate(&caller, "s", "t", &json!({"x": "a"})).allowed);
        assert!(!contains.evaluate(&caller, "s", "t", &json!({"x": "c"})).allowed);
        // `in` with a non-array value never matches.
        let bad_in = engine_for(ConditionOp::In, json!("a"));
        assert!(!bad_in.evaluate(&caller, "s", "t", &json!({"x": "a"})).allowed);

        let re = engine_for(ConditionOp::Regex, json!("^user_[0-9]+$"));
        assert!(re.evaluate(&caller, "s", "t", &json!({"x": "user_42"})).allowed);
        assert!(!re.evaluate(&caller, "s", "t", &json!({"x": "admin"})).allowed);

        // Invalid regex fails closed.
        let bad_re = engine_for(ConditionOp::Regex, json!("("));
        assert!(!bad_re.evaluate(&caller, "s", "t", &json!({"x": "("})).allowed);
    }

    #[test]
    fn numbers_compare_by_string_coercion() {
        let caller = ctx(&["reader"]);
        let engine = PolicyEngine::new(&[policy(
            "p",
            &["reader"],
            vec![Rule {
                server: None,
                tool: None,
                action: RuleAction::Allow,
                conditions: vec![Condition {
                    param: "limit".into(),
                    op: ConditionOp::Eq,
                    value: json!(5),
                }],
            }],
        )]);
        assert!(engine.evaluate(&caller, "s", "t", &json!({"limit": 5})).allowed);
        assert!(engine.evaluate(&caller, "s", "t", &json!({"limit": "5"})).allowed);
        assert!(!engine.evaluate(&caller, "s", "t", &json!({"limit": 6})).allowed);
    }

    #[test]
    fn reload_swaps_the_rule_set_atomically() {
        let engine = PolicyEngine::new(&[policy(
            "p",
            &["reader"],
            vec![rule(None, None, RuleAction::Deny)],
        )]);
        let caller = ctx(&["reader"]);
        assert!(!engine.evaluate(&caller, "s", "t", &json!({})).allowed);

        engine.reload(&[policy(
            "p",
            &["reader"],
            vec![rule(None, None, RuleAction::Allow)],
        )]);
        assert!(engine.evaluate(&caller, "s", "t", &json!({})).allowed);
    }
}
