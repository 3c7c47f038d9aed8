use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Kind of action the agent is asking permission for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
    FileCreate,
    FileEdit,
    FileDelete,
    ShellExecute,
    ToolInvocation,
}

/// Ordered severity classification for a requested action.
///
/// Declaration order is the risk scale: `Low < Medium < High < Critical`.
/// Unknown strings fail to deserialize, which downstream code treats as
/// "never auto-approve".
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// A permission prompt already classified by the process wrapper.
#[derive(Debug, Clone)]
pub struct ClassifiedPrompt {
    pub action: ActionKind,
    pub target: String,
    /// Surrounding output lines, for the human's benefit.
    pub context: String,
    pub risk: RiskLevel,
}

/// Events the process wrapper delivers to the deck.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    PermissionPrompt(ClassifiedPrompt),
    PhaseTransition { phase: String },
    Exited { code: i32 },
}

#[cfg(test)]
mod tests {
    use super::{ActionKind, RiskLevel};
    use std::str::FromStr;

    #[test]
    fn risk_levels_are_ordered() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn action_kind_round_trips_snake_case() {
        assert_eq!(ActionKind::ShellExecute.to_string(), "shell_execute");
        assert_eq!(
            ActionKind::from_str("file_create").unwrap(),
            ActionKind::FileCreate
        );
    }

    #[test]
    fn unknown_risk_string_is_rejected() {
        assert!(RiskLevel::from_str("catastrophic").is_err());
        assert!(serde_json::from_str::<RiskLevel>("\"catastrophic\"").is_err());
    }

    #[test]
    fn risk_level_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&RiskLevel::Critical).unwrap(),
            "\"critical\""
        );
    }
}
