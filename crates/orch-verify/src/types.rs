use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One reason completion cannot be accepted yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MissingCondition {
    WorkspaceMissing {
        path: Option<PathBuf>,
    },
    PhaseNotComplete {
        current: Option<String>,
    },
    DeliverableMissing {
        name: String,
        path: PathBuf,
    },
    NoCommits {
        since: String,
    },
    UncommittedChanges {
        paths: Vec<String>,
    },
    EvidenceUnavailable {
        message: String,
    },
}

impl MissingCondition {
    pub fn code(&self) -> &'static str {
        match self {
            MissingCondition::WorkspaceMissing { .. } => "workspace_missing",
            MissingCondition::PhaseNotComplete { .. } => "phase_not_complete",
            MissingCondition::DeliverableMissing { .. } => "deliverable_missing",
            MissingCondition::NoCommits { .. } => "no_commits",
            MissingCondition::UncommittedChanges { .. } => "uncommitted_changes",
            MissingCondition::EvidenceUnavailable { .. } => "evidence_unavailable",
        }
    }

    pub fn message(&self) -> String {
        match self {
            MissingCondition::WorkspaceMissing { path: Some(path) } => {
                format!("workspace file {} does not exist", path.display())
            }
            MissingCondition::WorkspaceMissing { path: None } => {
                "agent has no workspace file".to_string()
            }
            MissingCondition::PhaseNotComplete { current: Some(phase) } => {
                format!("workspace reports phase {phase:?}, not Complete")
            }
            MissingCondition::PhaseNotComplete { current: None } => {
                "workspace does not report a phase".to_string()
            }
            MissingCondition::DeliverableMissing { name, path } => {
                format!("deliverable {name:?} is missing at {}", path.display())
            }
            MissingCondition::NoCommits { since } => format!("no commits since {since}"),
            MissingCondition::UncommittedChanges { paths } => {
                let shown = paths.iter().take(5).cloned().collect::<Vec<_>>().join(", ");
                if paths.len() > 5 {
                    format!(
                        "{} uncommitted changes ({shown}, ...)",
                        paths.len()
                    )
                } else {
                    format!("{} uncommitted changes ({shown})", paths.len())
                }
            }
            MissingCondition::EvidenceUnavailable { message } => {
                format!("could not gather work evidence: {message}")
            }
        }
    }

    pub fn remedy(&self) -> String {
        match self {
            MissingCondition::WorkspaceMissing { .. } => {
                "recreate the workspace file or complete with --force once work is committed"
                    .to_string()
            }
            MissingCondition::PhaseNotComplete { .. } => {
                "wait for the agent to write 'Phase: Complete', or use --force if the work is committed"
                    .to_string()
            }
            MissingCondition::DeliverableMissing { path, .. } => {
                format!("ask the agent to produce {}", path.display())
            }
            MissingCondition::NoCommits { .. } => {
                "commit the agent's work before forcing completion".to_string()
            }
            MissingCondition::UncommittedChanges { .. } => {
                "commit or discard the listed changes".to_string()
            }
            MissingCondition::EvidenceUnavailable { .. } => {
                "check that git works in the project directory and retry".to_string()
            }
        }
    }
}

impl std::fmt::Display for MissingCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub ok: bool,
    pub forced: bool,
    #[serde(default)]
    pub missing: Vec<MissingCondition>,
    pub checked_at: DateTime<Utc>,
}

impl VerificationResult {
    pub fn from_missing(missing: Vec<MissingCondition>, forced: bool, at: DateTime<Utc>) -> Self {
        Self {
            ok: missing.is_empty(),
            forced,
            missing,
            checked_at: at,
        }
    }

    /// Human-readable refusal: one line per condition with its remedy.
    pub fn render(&self) -> String {
        self.missing
            .iter()
            .map(|condition| format!("- {}\n  fix: {}", condition.message(), condition.remedy()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-01T12:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn every_condition_has_message_and_remedy() {
        let conditions = vec![
            MissingCondition::WorkspaceMissing { path: None },
            MissingCondition::PhaseNotComplete {
                current: Some("Implementing".to_string()),
            },
            MissingCondition::DeliverableMissing {
                name: "report".to_string(),
                path: PathBuf::from("/src/api/REPORT.md"),
            },
            MissingCondition::NoCommits {
                since: "abc1234".to_string(),
            },
            MissingCondition::UncommittedChanges {
                paths: vec!["src/lib.rs".to_string()],
            },
            MissingCondition::EvidenceUnavailable {
                message: "git missing".to_string(),
            },
        ];
        for condition in &conditions {
            assert!(!condition.message().is_empty(), "{}", condition.code());
            assert!(!condition.remedy().is_empty(), "{}", condition.code());
        }

        let result = VerificationResult::from_missing(conditions, false, at());
        assert!(!result.ok);
        assert_eq!(result.render().matches("fix:").count(), 6);
    }

    #[test]
    fn long_change_lists_are_truncated() {
        let condition = MissingCondition::UncommittedChanges {
            paths: (0..8).map(|idx| format!("f{idx}.rs")).collect(),
        };
        assert_eq!(
            condition.message(),
            "8 uncommitted changes (f0.rs, f1.rs, f2.rs, f3.rs, f4.rs, ...)"
        );
    }

    #[test]
    fn result_is_ok_only_without_missing_conditions() {
        let refused = VerificationResult::from_missing(
            vec![MissingCondition::PhaseNotComplete { current: None }],
            false,
            at(),
        );
        assert!(!refused.ok);
        assert!(refused.render().contains("fix: "));

        let passed = VerificationResult::from_missing(Vec::new(), true, at());
        assert!(passed.ok);
        assert!(passed.forced);
        assert_eq!(passed.render(), "");
    }

    #[test]
    fn conditions_serialize_with_kind_tag() {
        let json = serde_json::to_value(MissingCondition::NoCommits {
            since: "2026-02-01T00:00:00Z".to_string(),
        })
        .expect("serialize");
        assert_eq!(json["kind"], "no_commits");
    }
}
