//! Agent lifecycle states and the forward-only transition rules.
//!
//! ```text
//! Active → Completed ─┐
//!        → Terminated ├→ Deleted (tombstone)
//!        → Abandoned ─┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Agent process is believed to be running.
    #[default]
    Active,
    /// Work finished and was verified or self-reported complete.
    Completed,
    /// Process vanished without a completion signal.
    Terminated,
    /// Explicitly given up on by the operator.
    Abandoned,
    /// Tombstone: kept only to block id reuse until purged.
    Deleted,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Completed => "completed",
            AgentStatus::Terminated => "terminated",
            AgentStatus::Abandoned => "abandoned",
            AgentStatus::Deleted => "deleted",
        }
    }

    /// Position in the lifecycle order. Statuses never move to a lower rank.
    pub fn rank(self) -> u8 {
        match self {
            AgentStatus::Active => 0,
            AgentStatus::Completed | AgentStatus::Terminated | AgentStatus::Abandoned => 1,
            AgentStatus::Deleted => 2,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, AgentStatus::Active)
    }

    /// Finished but not yet tombstoned.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Terminated | AgentStatus::Abandoned
        )
    }

    pub fn is_deleted(self) -> bool {
        matches!(self, AgentStatus::Deleted)
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "active" => Ok(AgentStatus::Active),
            "completed" => Ok(AgentStatus::Completed),
            "terminated" => Ok(AgentStatus::Terminated),
            "abandoned" => Ok(AgentStatus::Abandoned),
            "deleted" => Ok(AgentStatus::Deleted),
            other => Err(format!(
                "invalid agent status '{other}'. valid values: active, completed, terminated, abandoned, deleted"
            )),
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("invalid agent status transition: {from} -> {to}")]
    InvalidTransition { from: AgentStatus, to: AgentStatus },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub from: AgentStatus,
    pub to: AgentStatus,
    pub at: DateTime<Utc>,
}

/// Check whether `from -> to` respects the lifecycle order.
pub fn is_transition_allowed(from: AgentStatus, to: AgentStatus) -> bool {
    use AgentStatus::*;

    if from == to {
        return true;
    }

    match (from, to) {
        (Active, Completed) | (Active, Terminated) | (Active, Abandoned) => true,
        (Completed, Deleted) | (Terminated, Deleted) | (Abandoned, Deleted) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [AgentStatus; 5] = [
        AgentStatus::Active,
        AgentStatus::Completed,
        AgentStatus::Terminated,
        AgentStatus::Abandoned,
        AgentStatus::Deleted,
    ];

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&AgentStatus::Terminated).unwrap();
        assert_eq!(json, "\"terminated\"");
        assert_eq!("ABANDONED".parse::<AgentStatus>(), Ok(AgentStatus::Abandoned));
    }

    #[test]
    fn forward_transitions_allowed() {
        assert!(is_transition_allowed(
            AgentStatus::Active,
            AgentStatus::Completed
        ));
        assert!(is_transition_allowed(
            AgentStatus::Active,
            AgentStatus::Terminated
        ));
        assert!(is_transition_allowed(
            AgentStatus::Abandoned,
            AgentStatus::Deleted
        ));
    }

    #[test]
    fn backward_and_skipping_transitions_rejected() {
        assert!(!is_transition_allowed(
            AgentStatus::Completed,
            AgentStatus::Active
        ));
        assert!(!is_transition_allowed(
            AgentStatus::Deleted,
            AgentStatus::Active
        ));
        assert!(!is_transition_allowed(
            AgentStatus::Active,
            AgentStatus::Deleted
        ));
        assert!(!is_transition_allowed(
            AgentStatus::Completed,
            AgentStatus::Terminated
        ));
    }

    proptest! {
        #[test]
        fn allowed_transitions_never_lower_rank(from in 0usize..5, to in 0usize..5) {
            let (from, to) = (ALL[from], ALL[to]);
            if is_transition_allowed(from, to) {
                prop_assert!(from.rank() <= to.rank());
                prop_assert!(!(from.is_terminal() && to.is_active()));
            }
        }
    }
}
