use chrono::{DateTime, SecondsFormat, Utc};
use orch_core::phase::is_complete_phase;
use orch_core::types::AgentRecord;
use tracing::{debug, warn};

use crate::evidence::WorkEvidence;
use crate::exclusion::PathExclusions;
use crate::types::{MissingCondition, VerificationResult};
use crate::workspace::{is_missing, read_workspace_phase, workspace_file};

/// Decides whether an agent's work is done enough to tear it down.
///
/// Verification never fails fast: every unmet condition is collected so the
/// operator sees the whole list at once.
pub struct CompletionVerifier<'a> {
    evidence: &'a dyn WorkEvidence,
    exclusions: PathExclusions,
}

impl<'a> CompletionVerifier<'a> {
    pub fn new(evidence: &'a dyn WorkEvidence, exclusions: PathExclusions) -> Self {
        Self {
            evidence,
            exclusions,
        }
    }

    pub fn verify(&self, record: &AgentRecord, force: bool) -> VerificationResult {
        self.verify_at(record, force, Utc::now())
    }

    pub fn verify_at(
        &self,
        record: &AgentRecord,
        force: bool,
        at: DateTime<Utc>,
    ) -> VerificationResult {
        let mut missing = Vec::new();

        if !force {
            self.check_phase(record, &mut missing);
        }
        self.check_deliverables(record, &mut missing);
        if force {
            self.check_commits(record, &mut missing);
            self.check_clean_tree(record, &mut missing);
        }

        let result = VerificationResult::from_missing(missing, force, at);
        if result.ok {
            debug!(agent_id = %record.id, force, "verification passed");
        } else {
            let codes = result
                .missing
                .iter()
                .map(MissingCondition::code)
                .collect::<Vec<_>>();
            debug!(agent_id = %record.id, force, missing = ?codes, "verification refused");
        }
        result
    }

    fn check_phase(&self, record: &AgentRecord, missing: &mut Vec<MissingCondition>) {
        let Some(workspace_ref) = record.workspace_ref.as_deref() else {
            missing.push(MissingCondition::WorkspaceMissing { path: None });
            return;
        };

        match read_workspace_phase(workspace_ref) {
            Ok(Some(phase)) if is_complete_phase(&phase) => {}
            Ok(current) => missing.push(MissingCondition::PhaseNotComplete { current }),
            Err(err) if is_missing(&err) => missing.push(MissingCondition::WorkspaceMissing {
                path: Some(workspace_file(workspace_ref)),
            }),
            Err(err) => {
                warn!(agent_id = %record.id, error = %err, "cannot read workspace");
                missing.push(MissingCondition::EvidenceUnavailable {
                    message: err.to_string(),
                });
            }
        }
    }

    fn check_deliverables(&self, record: &AgentRecord, missing: &mut Vec<MissingCondition>) {
        for deliverable in record.deliverables.iter().filter(|d| d.required) {
            let path = if deliverable.path.is_absolute() {
                deliverable.path.clone()
            } else {
                record.project_path.join(&deliverable.path)
            };
            if !path.exists() {
                missing.push(MissingCondition::DeliverableMissing {
                    name: deliverable.name.clone(),
                    path,
                });
            }
        }
    }

    fn check_commits(&self, record: &AgentRecord, missing: &mut Vec<MissingCondition>) {
        let base = record.base_commit.as_deref();
        match self
            .evidence
            .commits_since(&record.project_path, base, record.created_at)
        {
            Ok(commits) if !commits.is_empty() => {}
            Ok(_) => missing.push(MissingCondition::NoCommits {
                since: base.map(str::to_string).unwrap_or_else(|| {
                    record
                        .created_at
                        .to_rfc3339_opts(SecondsFormat::Secs, true)
                }),
            }),
            Err(err) => {
                warn!(agent_id = %record.id, error = %err, "commit evidence unavailable");
                missing.push(MissingCondition::EvidenceUnavailable {
                    message: err.to_string(),
                });
            }
        }
    }

    fn check_clean_tree(&self, record: &AgentRecord, missing: &mut Vec<MissingCondition>) {
        match self.evidence.uncommitted_paths(&record.project_path) {
            Ok(paths) => {
                let mut dirty = paths
                    .into_iter()
                    .filter(|path| !self.exclusions.is_excluded(path))
                    .collect::<Vec<_>>();
                dirty.sort();
                dirty.dedup();
                if !dirty.is_empty() {
                    missing.push(MissingCondition::UncommittedChanges { paths: dirty });
                }
            }
            Err(err) => {
                warn!(agent_id = %record.id, error = %err, "working tree evidence unavailable");
                missing.push(MissingCondition::EvidenceUnavailable {
                    message: err.to_string(),
                });
            }
        }
    }
}
