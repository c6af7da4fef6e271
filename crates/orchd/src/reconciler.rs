//! Brings registry statuses in line with what is actually running.
//!
//! Reconciliation only reads probes and writes the registry. It never
//! terminates, focuses, or types into anything, so it is safe to run from
//! inside an agent's own window.

use chrono::Utc;
use orch_agents::{ApiSessionProbe, ProcessProbe, SessionScope};
use orch_beads::TrackerClient;
use orch_core::events::{Event, EventKind};
use orch_core::phase::is_complete_phase;
use orch_core::state::{AgentStatus, StatusTransition};
use orch_core::types::{AgentBackend, AgentId, AgentRecord, ProcessHandle};
use orch_verify::read_workspace_phase;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::registry::{AgentFilter, Registry, RegistryError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inconclusive {
    pub id: AgentId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Active records examined.
    pub checked: usize,
    pub transitions: Vec<(AgentId, StatusTransition)>,
    pub inconclusive: Vec<Inconclusive>,
}

enum Verdict {
    Alive,
    Ended { to: AgentStatus, reason: String },
    Inconclusive(String),
}

pub struct Reconciler<'a> {
    registry: &'a Registry,
    probe: &'a dyn ProcessProbe,
    api: &'a dyn ApiSessionProbe,
    tracker: Option<&'a dyn TrackerClient>,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        registry: &'a Registry,
        probe: &'a dyn ProcessProbe,
        api: &'a dyn ApiSessionProbe,
        tracker: Option<&'a dyn TrackerClient>,
    ) -> Self {
        Self {
            registry,
            probe,
            api,
            tracker,
        }
    }

    /// Reconcile the active records matching `filter`.
    pub fn reconcile(&self, filter: &AgentFilter) -> Result<ReconcileReport, RegistryError> {
        let active = AgentFilter {
            statuses: vec![AgentStatus::Active],
            ..filter.clone()
        };
        let records = self.registry.list(&active)?.collect::<Vec<_>>();
        let mut report = ReconcileReport {
            checked: records.len(),
            ..ReconcileReport::default()
        };
        if records.is_empty() {
            return Ok(report);
        }

        let has_windows = records
            .iter()
            .any(|record| matches!(record.backend, AgentBackend::Process { .. }));
        // One listing covers every session, so agents whose session was
        // renamed or moved are still found.
        let live_windows = if has_windows {
            self.probe
                .list_live_handles(&SessionScope::All)
                .map_err(|err| {
                    warn!(error = %err, "cannot list live windows; leaving process agents untouched");
                    err.to_string()
                })
        } else {
            Ok(BTreeSet::new())
        };

        for record in records {
            let verdict = match &record.backend {
                AgentBackend::Process { handle } => match &live_windows {
                    Ok(live) => self.judge_window(&record, handle, live),
                    Err(message) => Verdict::Inconclusive(format!("process probe failed: {message}")),
                },
                AgentBackend::Api { session_ref } => self.judge_session(&record, session_ref),
            };

            match verdict {
                Verdict::Alive => debug!(agent_id = %record.id, "agent still running"),
                Verdict::Ended { to, reason } => {
                    info!(agent_id = %record.id, to = %to, reason = %reason, "reconciling agent status");
                    if let Some(transition) =
                        self.registry
                            .transition(&record.id, AgentStatus::Active, to, Some(reason))?
                    {
                        report.transitions.push((record.id.clone(), transition));
                    }
                }
                Verdict::Inconclusive(reason) => {
                    warn!(agent_id = %record.id, reason = %reason, "reconciliation inconclusive");
                    report.inconclusive.push(Inconclusive {
                        id: record.id.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(report)
    }

    fn judge_window(
        &self,
        record: &AgentRecord,
        handle: &ProcessHandle,
        live: &BTreeSet<ProcessHandle>,
    ) -> Verdict {
        if live.iter().any(|candidate| candidate.same_window(handle)) {
            return Verdict::Alive;
        }
        if workspace_reports_complete(record) {
            Verdict::Ended {
                to: AgentStatus::Completed,
                reason: "window closed after workspace reported Phase: Complete".to_string(),
            }
        } else {
            Verdict::Ended {
                to: AgentStatus::Terminated,
                reason: "window vanished without completion signal".to_string(),
            }
        }
    }

    fn judge_session(&self, record: &AgentRecord, session_ref: &str) -> Verdict {
        match self.api.is_session_live(session_ref) {
            Ok(true) => return Verdict::Alive,
            Ok(false) => {}
            Err(err) => return Verdict::Inconclusive(format!("session probe failed: {err}")),
        }

        if workspace_reports_complete(record) {
            return Verdict::Ended {
                to: AgentStatus::Completed,
                reason: "session ended after workspace reported Phase: Complete".to_string(),
            };
        }

        let (Some(tracker), Some(issue_ref)) = (self.tracker, record.external_ref.as_deref())
        else {
            return Verdict::Ended {
                to: AgentStatus::Terminated,
                reason: "session ended without completion signal".to_string(),
            };
        };

        match tracker.get_issue(&record.project_path, issue_ref) {
            Ok(issue) if issue.reports_completion() => Verdict::Ended {
                to: AgentStatus::Completed,
                reason: format!("session ended; tracker issue {issue_ref} reports completion"),
            },
            Ok(_) => Verdict::Ended {
                to: AgentStatus::Terminated,
                reason: "session ended without completion signal".to_string(),
            },
            Err(err) => {
                self.registry.record_event(Event::for_agent(
                    &record.id,
                    Utc::now(),
                    EventKind::TrackerUnavailable {
                        message: err.to_string(),
                    },
                ));
                Verdict::Inconclusive(format!(
                    "session ended but tracker is unavailable: {err}"
                ))
            }
        }
    }
}

fn workspace_reports_complete(record: &AgentRecord) -> bool {
    let Some(workspace_ref) = record.workspace_ref.as_deref() else {
        return false;
    };
    match read_workspace_phase(workspace_ref) {
        Ok(Some(phase)) => is_complete_phase(&phase),
        Ok(None) => false,
        Err(err) => {
            debug!(agent_id = %record.id, error = %err, "workspace unreadable");
            false
        }
    }
}
