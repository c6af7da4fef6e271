use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::command::{AllowedTrackerCommand, BeadsCli};
use crate::error::TrackerError;
use crate::types::{parse_comments_json, parse_issue_json, IssueStatus, TrackerIssue};

/// Issue tracker access. Each project keeps its own tracker database, so every
/// call names the project it runs in.
pub trait TrackerClient {
    fn get_issue(&self, project: &Path, issue_ref: &str) -> Result<TrackerIssue, TrackerError>;
    fn set_status(
        &self,
        project: &Path,
        issue_ref: &str,
        status: &IssueStatus,
    ) -> Result<(), TrackerError>;
    fn close(&self, project: &Path, issue_ref: &str, reason: &str) -> Result<(), TrackerError>;
    fn add_comment(&self, project: &Path, issue_ref: &str, text: &str)
        -> Result<(), TrackerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BeadsClient {
    pub cli: BeadsCli,
}

impl BeadsClient {
    pub fn new(binary: impl Into<std::path::PathBuf>, timeout: Duration) -> Self {
        Self {
            cli: BeadsCli::new(binary, timeout),
        }
    }

    pub fn with_cli(cli: BeadsCli) -> Self {
        Self { cli }
    }
}

impl TrackerClient for BeadsClient {
    fn get_issue(&self, project: &Path, issue_ref: &str) -> Result<TrackerIssue, TrackerError> {
        let output = self.cli.run_allowed(
            project,
            AllowedTrackerCommand::Show,
            ["show", issue_ref, "--json"],
        )?;
        let mut issue = parse_issue_json(&output.stdout)?;

        // Older bd releases omit comments from `show`; a closed issue needs none.
        if issue.comments.is_empty() && !issue.is_closed() {
            let output = self.cli.run_allowed(
                project,
                AllowedTrackerCommand::ListComments,
                ["comments", issue_ref, "--json"],
            )?;
            issue.comments = parse_comments_json(&output.stdout)?;
        }
        debug!(issue = issue_ref, status = %issue.status, comments = issue.comments.len(), "fetched tracker issue");
        Ok(issue)
    }

    fn set_status(
        &self,
        project: &Path,
        issue_ref: &str,
        status: &IssueStatus,
    ) -> Result<(), TrackerError> {
        self.cli.run_allowed(
            project,
            AllowedTrackerCommand::UpdateStatus,
            ["update", issue_ref, "--status", status.as_str()],
        )?;
        Ok(())
    }

    fn close(&self, project: &Path, issue_ref: &str, reason: &str) -> Result<(), TrackerError> {
        if reason.trim().is_empty() {
            return Err(TrackerError::ContractViolation {
                message: "close reason must not be empty".to_string(),
            });
        }
        self.cli.run_allowed(
            project,
            AllowedTrackerCommand::Close,
            ["close", issue_ref, "--reason", reason],
        )?;
        Ok(())
    }

    fn add_comment(
        &self,
        project: &Path,
        issue_ref: &str,
        text: &str,
    ) -> Result<(), TrackerError> {
        self.cli.run_allowed(
            project,
            AllowedTrackerCommand::AddComment,
            ["comments", "add", issue_ref, text],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_client() -> BeadsClient {
        BeadsClient::new("/definitely/missing/bd-binary", Duration::from_secs(1))
    }

    #[test]
    fn unsupported_status_is_refused_before_running() {
        let err = missing_client()
            .set_status(
                Path::new("."),
                "orch-1",
                &IssueStatus::Other("wontfix".to_string()),
            )
            .expect_err("status outside the contract");
        assert!(matches!(err, TrackerError::ContractViolation { .. }));
    }

    #[test]
    fn empty_close_reason_is_refused() {
        let err = missing_client()
            .close(Path::new("."), "orch-1", " ")
            .expect_err("empty reason");
        assert!(matches!(err, TrackerError::ContractViolation { .. }));
    }

    #[test]
    fn unreachable_tracker_surfaces_as_error() {
        let err = missing_client()
            .get_issue(Path::new("."), "orch-1")
            .expect_err("missing binary");
        assert!(matches!(err, TrackerError::Io { .. }));
    }
}
