use std::sync::Arc;

use globset::{GlobBuilder, GlobMatcher};
use magsag_protocol::{
    GateError, GateResult, Permission, PolicyContext, PolicyDecision, PolicyDocument, PolicyRule,
};
use parking_lot::RwLock;
use tracing::{debug, info};

pub trait PolicyEngine: Send + Sync {
    fn decide(&self, tool_name: &str, context: &PolicyContext) -> PolicyDecision;

    fn evaluate(&self, tool_name: &str, context: &PolicyContext) -> Permission {
        self.decide(tool_name, context).permission
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    matcher: GlobMatcher,
    rule: PolicyRule,
}

impl CompiledRule {
    fn compile(index: usize, rule: &PolicyRule) -> GateResult<Self> {
        let glob = GlobBuilder::new(&rule.tool_pattern)
            .literal_separator(false)
            .build()
            .map_err(|error| {
                GateError::InvalidPolicy(format!(
                    "rule {index}: bad tool_pattern {:?}: {error}",
                    rule.tool_pattern
                ))
            })?;
        Ok(Self {
            matcher: glob.compile_matcher(),
            rule: rule.clone(),
        })
    }

    fn matches(&self, tool_name: &str, context: &PolicyContext) -> bool {
        self.matcher.is_match(tool_name)
            && self
                .rule
                .when
                .iter()
                .all(|(key, expected)| context.get(key) == Some(expected))
    }
}

/// Immutable, pre-compiled policy. Evaluation is a pure function of the
/// document it was built from and its inputs.
#[derive(Debug, Clone)]
pub struct PermissionEvaluator {
    default: Permission,
    rules: Vec<CompiledRule>,
}

impl PermissionEvaluator {
    /// Compile every rule; a malformed glob fails here, never at evaluation.
    pub fn new(document: PolicyDocument) -> GateResult<Self> {
        let rules = document
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| CompiledRule::compile(index, rule))
            .collect::<GateResult<Vec<_>>>()?;
        Ok(Self {
            default: document.default,
            rules,
        })
    }

    pub fn default_permission(&self) -> Permission {
        self.default
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl PolicyEngine for PermissionEvaluator {
    fn decide(&self, tool_name: &str, context: &PolicyContext) -> PolicyDecision {
        let decision = self
            .rules
            .iter()
            .position(|compiled| compiled.matches(tool_name, context))
            .map(|index| PolicyDecision {
                permission: self.rules[index].rule.permission,
                matched_rule: Some(index),
            })
            .unwrap_or(PolicyDecision {
                permission: self.default,
                matched_rule: None,
            });
        debug!(
            tool_name,
            permission = %decision.permission,
            matched_rule = ?decision.matched_rule,
            "policy evaluated"
        );
        decision
    }
}

/// Swappable reference to the active evaluator.
///
/// Reloading compiles a new evaluator and replaces the reference; callers
/// holding a snapshot from [`PolicyHandle::current`] keep evaluating against
/// the policy they started with.
#[derive(Debug, Clone)]
pub struct PolicyHandle {
    current: Arc<RwLock<Arc<PermissionEvaluator>>>,
}

impl PolicyHandle {
    pub fn new(document: PolicyDocument) -> GateResult<Self> {
        Ok(Self::from_evaluator(PermissionEvaluator::new(document)?))
    }

    pub fn from_evaluator(evaluator: PermissionEvaluator) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(evaluator))),
        }
    }

    pub fn current(&self) -> Arc<PermissionEvaluator> {
        self.current.read().clone()
    }

    /// On a compile error the previous policy stays active.
    pub fn reload(&self, document: PolicyDocument) -> GateResult<()> {
        let evaluator = PermissionEvaluator::new(document)?;
        let rule_count = evaluator.rule_count();
        *self.current.write() = Arc::new(evaluator);
        info!(rule_count, "policy reloaded");
        Ok(())
    }
}

impl PolicyEngine for PolicyHandle {
    fn decide(&self, tool_name: &str, context: &PolicyContext) -> PolicyDecision {
        self.current().decide(tool_name, context)
    }
}
