use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{ActionKind, RiskLevel};

/// An auto-approve rule.
///
/// Rules are evaluated in list order; the first enabled rule whose action
/// and pattern match a request decides the outcome, whether that outcome is
/// an approval or a risk-exceeded rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub action: ActionKind,
    /// Glob over the request target. Supports `*`, `**` and single-level
    /// brace alternation (`*.{ts,tsx}`).
    pub pattern: String,
    #[serde(default = "default_max_risk")]
    pub max_risk: RiskLevel,
}

fn default_enabled() -> bool {
    true
}

fn default_max_risk() -> RiskLevel {
    RiskLevel::Medium
}

/// Outcome of matching one request against the rule list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyMatch {
    /// A rule matched and the request's risk is within its ceiling.
    AutoApprove { rule: PolicyRule },
    /// A rule matched on action and pattern but the request's risk exceeds
    /// the rule's ceiling. Evaluation stops here; later rules do not get a
    /// chance to approve.
    RiskExceeded { rule: PolicyRule, reason: String },
    /// No enabled rule matched on action and pattern.
    NoMatch { reason: String },
}

impl PolicyMatch {
    pub fn rule_name(&self) -> Option<&str> {
        match self {
            Self::AutoApprove { rule } | Self::RiskExceeded { rule, .. } => Some(&rule.name),
            Self::NoMatch { .. } => None,
        }
    }

    pub fn is_auto_approve(&self) -> bool {
        matches!(self, Self::AutoApprove { .. })
    }
}

/// A [`PolicyMatch`] plus the inputs and counters the audit trail wants.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub matched: PolicyMatch,
    pub evaluated_at: DateTime<Utc>,
    pub evaluation_count: u64,
    pub action: ActionKind,
    pub target: String,
    pub risk: RiskLevel,
}
