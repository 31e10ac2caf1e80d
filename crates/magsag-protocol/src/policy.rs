//! Policy types: permissions, typed evaluation context, and policy documents.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GateError;

/// Outcome of evaluating a tool against a policy.
///
/// The default is `RequireApproval`: an unmatched tool fails toward caution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Always,
    #[default]
    RequireApproval,
    Never,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::RequireApproval => "require_approval",
            Self::Never => "never",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of keys a policy rule may condition on.
///
/// Parsing an unknown key is an error, so a typo such as `enviroment` is
/// caught where the context or the policy is built rather than silently
/// never matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKey {
    /// Deployment environment, e.g. `production`.
    Environment,
    /// Slug of the agent issuing the call.
    AgentSlug,
    Tenant,
    /// Surface the request came through, e.g. `api` or `webhook`.
    Channel,
}

impl ContextKey {
    pub const ALL: [ContextKey; 4] = [
        Self::Environment,
        Self::AgentSlug,
        Self::Tenant,
        Self::Channel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Environment => "environment",
            Self::AgentSlug => "agent_slug",
            Self::Tenant => "tenant",
            Self::Channel => "channel",
        }
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextKey {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| GateError::InvalidPolicy(format!("unknown context key: {s}")))
    }
}

/// Typed evaluation context passed alongside a tool name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyContext(BTreeMap<ContextKey, String>);

impl PolicyContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: ContextKey, value: impl Into<String>) -> Self {
        self.0.insert(key, value.into());
        self
    }

    pub fn insert(&mut self, key: ContextKey, value: impl Into<String>) {
        self.0.insert(key, value.into());
    }

    pub fn get(&self, key: ContextKey) -> Option<&str> {
        self.0.get(&key).map(String::as_str)
    }

    /// Build from untyped string pairs, rejecting unrecognized keys.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, GateError> {
        let mut context = Self::new();
        for (key, value) in pairs {
            context.insert(key.parse()?, value);
        }
        Ok(context)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ContextKey, &str)> {
        self.0.iter().map(|(key, value)| (*key, value.as_str()))
    }
}

/// One rule of a policy document. Unknown fields are rejected: a misspelled
/// `when` would otherwise widen the rule to every context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    /// Glob matched against the whole tool name (`write_*`, `*-experimental`).
    pub tool_pattern: String,
    pub permission: Permission,
    /// Every listed key must be present in the context with an equal value.
    #[serde(default, alias = "context_conditions")]
    pub when: PolicyContext,
}

impl PolicyRule {
    pub fn new(tool_pattern: impl Into<String>, permission: Permission) -> Self {
        Self {
            tool_pattern: tool_pattern.into(),
            permission,
            when: PolicyContext::default(),
        }
    }

    pub fn when(mut self, key: ContextKey, value: impl Into<String>) -> Self {
        self.when.insert(key, value);
        self
    }
}

/// Declarative rule list. Rules are evaluated in order; first match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    #[serde(default)]
    pub default: Permission,
    #[serde(default, alias = "tools")]
    pub rules: Vec<PolicyRule>,
}

impl PolicyDocument {
    pub fn new(default: Permission) -> Self {
        Self {
            default,
            rules: Vec::new(),
        }
    }

    pub fn rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// A permission together with the index of the rule that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub permission: Permission,
    /// `None` when the document default applied.
    pub matched_rule: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_defaults_to_require_approval() {
        let doc: PolicyDocument = serde_json::from_str("{}").unwrap();
        assert_eq!(doc.default, Permission::RequireApproval);
        assert!(doc.rules.is_empty());
    }

    #[test]
    fn document_parses_rules_with_conditions() {
        let doc: PolicyDocument = serde_json::from_str(
            r#"{
                "default": "never",
                "rules": [
                    {"tool_pattern": "write_*", "permission": "require_approval",
                     "when": {"environment": "production"}},
                    {"tool_pattern": "read_*", "permission": "always"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(doc.default, Permission::Never);
        assert_eq!(doc.rules.len(), 2);
        assert_eq!(
            doc.rules[0].when.get(ContextKey::Environment),
            Some("production")
        );
    }

    #[test]
    fn unknown_context_key_is_rejected() {
        let parsed = serde_json::from_str::<PolicyRule>(
            r#"{"tool_pattern": "x", "permission": "always", "when": {"enviroment": "prod"}}"#,
        );
        assert!(parsed.is_err());

        let err = PolicyContext::from_pairs([("enviroment", "prod")]).unwrap_err();
        assert!(err.to_string().contains("unknown context key"));
    }

    #[test]
    fn misspelled_rule_field_is_rejected() {
        let parsed = serde_json::from_str::<PolicyRule>(
            r#"{"tool_pattern": "deploy_*", "permission": "always",
                "condition": {"environment": "staging"}}"#,
        );
        let err = parsed.unwrap_err();
        assert!(err.to_string().contains("unknown field `condition`"));

        let parsed = serde_json::from_str::<PolicyDocument>(
            r#"{"default": "never", "rule": [{"tool_pattern": "x", "permission": "always"}]}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn aliases_still_accepted() {
        let doc: PolicyDocument = serde_json::from_str(
            r#"{"tools": [{"tool_pattern": "deploy_*", "permission": "never",
                "context_conditions": {"environment": "production"}}]}"#,
        )
        .unwrap();
        assert_eq!(doc.rules.len(), 1);
        assert_eq!(doc.rules[0].when.get(ContextKey::Environment), Some("production"));
    }
}
