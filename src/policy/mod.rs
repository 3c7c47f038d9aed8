//! Auto-approve policy engine.
//!
//! Evaluates classified permission requests against an ordered rule list so
//! routine actions never wake a human. The rule list is copy-on-write: a
//! concurrent evaluation always sees either the old list or the new one,
//! never a partially-mutated state.

mod pattern;
mod types;

pub use pattern::TargetPattern;
pub use types::{Evaluation, PolicyMatch, PolicyRule};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use chrono::Utc;

use crate::agent::{ActionKind, RiskLevel};
use crate::error::PolicyError;

#[derive(Clone)]
struct CompiledRule {
    rule: PolicyRule,
    pattern: TargetPattern,
}

pub struct PolicyEngine {
    rules: ArcSwap<Vec<CompiledRule>>,
    evaluation_count: AtomicU64,
}

impl PolicyEngine {
    /// Build an engine from configured rules. Disabled rules are dropped;
    /// an invalid glob in any enabled rule is a construction error, never a
    /// panic at evaluation time.
    pub fn new(rules: Vec<PolicyRule>) -> Result<Self, PolicyError> {
        let compiled = rules
            .into_iter()
            .filter(|r| r.enabled)
            .map(compile)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(active_rules = compiled.len(), "policy engine initialized");

        Ok(Self {
            rules: ArcSwap::from_pointee(compiled),
            evaluation_count: AtomicU64::new(0),
        })
    }

    /// Evaluate a request against the rule list.
    ///
    /// First enabled rule matching on action and pattern decides: risk
    /// within the ceiling auto-approves, risk above it stops evaluation
    /// with `RiskExceeded` — a later, more permissive rule never gets a
    /// look-in. Matching no rule at all yields `NoMatch`.
    pub fn evaluate(&self, action: ActionKind, target: &str, risk: RiskLevel) -> Evaluation {
        let count = self.evaluation_count.fetch_add(1, Ordering::Relaxed) + 1;
        let rules = self.rules.load();

        let matched = rules
            .iter()
            .find(|c| c.rule.action == action && c.pattern.matches(target))
            .map_or_else(
                || PolicyMatch::NoMatch {
                    reason: "no matching policy".to_string(),
                },
                |c| {
                    if risk <= c.rule.max_risk {
                        tracing::info!(
                            policy = %c.rule.name,
                            %action,
                            target,
                            %risk,
                            "policy matched - auto-approve"
                        );
                        PolicyMatch::AutoApprove {
                            rule: c.rule.clone(),
                        }
                    } else {
                        PolicyMatch::RiskExceeded {
                            rule: c.rule.clone(),
                            reason: format!(
                                "risk {risk} exceeds policy max {}",
                                c.rule.max_risk
                            ),
                        }
                    }
                },
            );

        Evaluation {
            matched,
            evaluated_at: Utc::now(),
            evaluation_count: count,
            action,
            target: target.to_string(),
            risk,
        }
    }

    /// Add a rule at runtime. Disabled rules are ignored (returns false).
    /// Rules sharing a name are not merged; the caller owns uniqueness.
    pub fn add_rule(&self, rule: PolicyRule) -> Result<bool, PolicyError> {
        if !rule.enabled {
            return Ok(false);
        }
        let compiled = compile(rule)?;
        self.rules.rcu(|rules| {
            let mut next = (**rules).clone();
            next.push(compiled.clone());
            next
        });
        tracing::info!(policy = %compiled.rule.name, "policy added");
        Ok(true)
    }

    /// Remove the first rule with the given name. Returns whether a rule
    /// was removed.
    pub fn remove_rule(&self, name: &str) -> bool {
        let previous = self.rules.rcu(|rules| {
            let mut next = (**rules).clone();
            if let Some(idx) = next.iter().position(|c| c.rule.name == name) {
                next.remove(idx);
            }
            next
        });
        let removed = previous.iter().any(|c| c.rule.name == name);
        if removed {
            tracing::info!(policy = name, "policy removed");
        }
        removed
    }

    pub fn rule(&self, name: &str) -> Option<PolicyRule> {
        self.rules
            .load()
            .iter()
            .find(|c| c.rule.name == name)
            .map(|c| c.rule.clone())
    }

    pub fn rules(&self) -> Vec<PolicyRule> {
        self.rules.load().iter().map(|c| c.rule.clone()).collect()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.load().len()
    }

    pub fn evaluation_count(&self) -> u64 {
        self.evaluation_count.load(Ordering::Relaxed)
    }
}

fn compile(rule: PolicyRule) -> Result<CompiledRule, PolicyError> {
    let pattern = TargetPattern::compile(&rule.name, &rule.pattern)?;
    Ok(CompiledRule { rule, pattern })
}
