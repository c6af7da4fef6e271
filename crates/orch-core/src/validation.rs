//! Sanity checks for a loaded [`OrchConfig`].

use serde::{Deserialize, Serialize};

use crate::config::OrchConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues
        .iter()
        .any(|issue| issue.level == ValidationLevel::Error)
}

impl Validate for OrchConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.registry.lock_timeout_ms == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "registry.lock_timeout.zero",
                message: "lock_timeout_ms must be greater than zero".to_string(),
            });
        }

        if self.registry.retry_initial_ms == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "registry.retry_initial.zero",
                message: "retry_initial_ms must be greater than zero".to_string(),
            });
        }

        if self.registry.retry_max_ms < self.registry.retry_initial_ms {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "registry.retry_max.below_initial",
                message: format!(
                    "retry_max_ms ({}) is below retry_initial_ms ({}); backoff will not grow",
                    self.registry.retry_max_ms, self.registry.retry_initial_ms
                ),
            });
        }

        if self.registry.stale_lock_secs * 1_000 <= self.registry.lock_timeout_ms {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "registry.stale_lock.short",
                message: format!(
                    "stale_lock_secs {}s does not exceed the lock timeout; live holders may lose their lock",
                    self.registry.stale_lock_secs
                ),
            });
        }

        if self.tmux.session_prefix.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "tmux.session_prefix.empty",
                message: "session_prefix cannot be empty".to_string(),
            });
        }

        if self.tmux.session_prefix.contains([':', '.']) {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "tmux.session_prefix.invalid",
                message: "session_prefix cannot contain ':' or '.'".to_string(),
            });
        }

        if self.shutdown.poll_interval_ms == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "shutdown.poll_interval.zero",
                message: "poll_interval_ms must be greater than zero".to_string(),
            });
        }

        if self.tracker.enabled && self.tracker.timeout_secs == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "tracker.timeout.zero",
                message: "tracker timeout cannot be 0 while the tracker is enabled".to_string(),
            });
        }

        if self.agent.workspace_dir.is_absolute() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "agent.workspace_dir.absolute",
                message: "workspace_dir is absolute; workspaces of all projects will share it"
                    .to_string(),
            });
        }

        for pattern in &self.verify.excluded_paths {
            if pattern.trim().is_empty() || pattern.trim() == "/" || pattern.trim() == "." {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Error,
                    code: "verify.excluded_paths.everything",
                    message: format!(
                        "excluded path {pattern:?} would hide every uncommitted change"
                    ),
                });
            }
        }

        for (name, skill) in &self.skills {
            for deliverable in &skill.deliverables {
                if deliverable.path.trim().is_empty() {
                    issues.push(ValidationIssue {
                        level: ValidationLevel::Error,
                        code: "skills.deliverable.path.empty",
                        message: format!(
                            "deliverable {:?} of skill {name:?} has an empty path",
                            deliverable.name
                        ),
                    });
                }
            }
        }

        issues
    }
}
