//! Committed-work evidence gathered from the project repository.

use chrono::{DateTime, Utc};
use orch_git::{
    commits_since, commits_since_time, discover_repo, uncommitted_changes, CommitSummary, GitCli,
    GitError,
};
use std::path::Path;
use tracing::warn;

use crate::error::VerifyError;

pub trait WorkEvidence {
    /// Commits made after `base`, or after `since` when there is no usable base.
    fn commits_since(
        &self,
        project: &Path,
        base: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<CommitSummary>, VerifyError>;

    /// Project-relative paths with uncommitted changes under `project`,
    /// rename sources included.
    fn uncommitted_paths(&self, project: &Path) -> Result<Vec<String>, VerifyError>;

    /// Current HEAD, recorded at spawn so later checks have a base.
    fn head(&self, project: &Path) -> Result<Option<String>, VerifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GitEvidence {
    pub git: GitCli,
}

impl GitEvidence {
    pub fn new(git: GitCli) -> Self {
        Self { git }
    }
}

impl WorkEvidence for GitEvidence {
    fn commits_since(
        &self,
        project: &Path,
        base: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<CommitSummary>, VerifyError> {
        let repo = discover_repo(project, &self.git)?;
        if let Some(base) = base {
            match commits_since(&repo, &self.git, base) {
                Ok(commits) => return Ok(commits),
                Err(GitError::UnknownRevision { revision, .. }) => {
                    warn!(
                        project = %project.display(),
                        base = %revision,
                        "spawn commit no longer exists; falling back to commit time"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(commits_since_time(&repo, &self.git, since)?)
    }

    fn uncommitted_paths(&self, project: &Path) -> Result<Vec<String>, VerifyError> {
        discover_repo(project, &self.git)?;
        let mut paths = Vec::new();
        for change in uncommitted_changes(&self.git, project)? {
            if let Some(original) = change.original_path {
                paths.push(original);
            }
            paths.push(change.path);
        }
        Ok(paths)
    }

    fn head(&self, project: &Path) -> Result<Option<String>, VerifyError> {
        let repo = discover_repo(project, &self.git)?;
        Ok(orch_git::head_sha(&repo, &self.git)?)
    }
}
