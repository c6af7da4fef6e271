//! Spawning, completing, and tearing down agents.
//!
//! This is the only place that terminates processes. Every terminate path
//! first checks whether the target could be the window this process runs in;
//! if so the teardown is recorded as pending and left to `orch sweep` run
//! from somewhere else.

use chrono::{Duration as ChronoDuration, Utc};
use orch_agents::{
    default_adapter_for, ApiSessionProbe, LaunchRequest, ProbeError, ProcessProbe,
};
use orch_beads::{IssueStatus, TrackerClient, TrackerError};
use orch_core::config::OrchConfig;
use orch_core::events::{Event, EventKind};
use orch_core::state::AgentStatus;
use orch_core::types::{
    project_slug, slugify, AgentBackend, AgentId, AgentRecord, ModelKind, ProcessHandle,
};
use orch_verify::{
    create_workspace, CompletionVerifier, PathExclusions, VerificationResult, WorkEvidence,
    WORKSPACE_FILE,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::reconciler::{ReconcileReport, Reconciler};
use crate::registry::{AgentFilter, Registry, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("failed to spawn agent: {message}")]
    Spawn { message: String },
    #[error("agent {id} not found")]
    NotFound { id: AgentId },
    #[error("agent {id} was already completed and removed")]
    AlreadyDeleted { id: AgentId },
    #[error("agent {id} is {status}; cannot {action}")]
    InvalidState {
        id: AgentId,
        status: AgentStatus,
        action: &'static str,
    },
    #[error("agent {id} runs as {backend} and does not support {action}")]
    UnsupportedBackend {
        id: AgentId,
        backend: &'static str,
        action: &'static str,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub project_path: PathBuf,
    pub task: String,
    /// Defaults to the task plus instructions for reporting the phase.
    pub prompt: Option<String>,
    pub model: Option<ModelKind>,
    pub skill: Option<String>,
    /// Tracker issue the agent works on.
    pub issue: Option<String>,
    pub headless: bool,
    pub extra_args: Vec<String>,
}

impl SpawnRequest {
    pub fn new(project_path: impl Into<PathBuf>, task: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            task: task.into(),
            prompt: None,
            model: None,
            skill: None,
            issue: None,
            headless: false,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownOutcome {
    /// Nothing was running any more.
    AlreadyGone,
    Graceful,
    Forced,
    /// The caller may be the agent itself; left for `orch sweep`.
    Deferred,
    /// Ignored the graceful request and forcing was not permitted.
    LeftRunning,
    Failed(String),
}

impl TeardownOutcome {
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            TeardownOutcome::AlreadyGone | TeardownOutcome::Graceful | TeardownOutcome::Forced
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteOutcome {
    Refused(VerificationResult),
    Completed {
        record: AgentRecord,
        verification: VerificationResult,
        teardown: TeardownOutcome,
        tombstoned: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonOutcome {
    pub record: AgentRecord,
    pub teardown: TeardownOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// The current window could not be identified, so nothing was touched.
    pub skipped_unknown_observer: bool,
    pub skipped_self: Vec<AgentId>,
    pub finished: Vec<(AgentId, TeardownOutcome)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub reconcile: ReconcileReport,
    pub sweep: SweepReport,
    pub tombstoned: Vec<AgentId>,
    pub purged: Vec<AgentId>,
}

pub struct LifecycleController<'a> {
    config: &'a OrchConfig,
    registry: &'a Registry,
    probe: &'a dyn ProcessProbe,
    api: &'a dyn ApiSessionProbe,
    tracker: Option<&'a dyn TrackerClient>,
    evidence: &'a dyn WorkEvidence,
}

impl<'a> LifecycleController<'a> {
    pub fn new(
        config: &'a OrchConfig,
        registry: &'a Registry,
        probe: &'a dyn ProcessProbe,
        api: &'a dyn ApiSessionProbe,
        tracker: Option<&'a dyn TrackerClient>,
        evidence: &'a dyn WorkEvidence,
    ) -> Self {
        Self {
            config,
            registry,
            probe,
            api,
            tracker,
            evidence,
        }
    }

    pub fn reconciler(&self) -> Reconciler<'a> {
        Reconciler::new(self.registry, self.probe, self.api, self.tracker)
    }

    /// Start an agent and register it once its process exists.
    pub fn spawn(&self, request: SpawnRequest) -> Result<AgentRecord, LifecycleError> {
        let now = Utc::now();
        let project = request.project_path.clone();
        let id = AgentId::generate(&project, &request.task, now);
        let model = request.model.unwrap_or(self.config.agent.default_model);

        let ws_dir = project
            .join(&self.config.agent.workspace_dir)
            .join(id.as_str());
        create_workspace(&ws_dir, &id, &request.task).map_err(|err| LifecycleError::Spawn {
            message: err.to_string(),
        })?;

        let base_commit = match self.evidence.head(&project) {
            Ok(head) => head,
            Err(err) => {
                debug!(project = %project.display(), error = %err, "no base commit recorded");
                None
            }
        };
        let deliverables =
            self.config
                .deliverables_for(request.skill.as_deref(), &id, &project, &ws_dir);

        let mut extra_args = self.config.agent.extra_args.clone();
        extra_args.extend(request.extra_args.iter().cloned());
        let launch = LaunchRequest {
            agent_id: id.clone(),
            model,
            project_path: project.clone(),
            workspace_path: ws_dir.clone(),
            prompt: request
                .prompt
                .clone()
                .unwrap_or_else(|| default_prompt(&request.task, &ws_dir)),
            extra_args,
            env: Vec::new(),
        };
        let command = default_adapter_for(model).build_command(&launch);

        let backend = if request.headless {
            self.api
                .spawn_session(&project, &command, &ws_dir.join("agent.log"))
                .map(|session_ref| AgentBackend::Api { session_ref })
        } else {
            let session = self.config.session_name(&project_slug(&project));
            self.probe
                .spawn_handle(&session, &slugify(&request.task), &project, &command)
                .map(|handle| AgentBackend::Process { handle })
        };
        let backend = match backend {
            Ok(backend) => backend,
            Err(err) => {
                remove_workspace(&ws_dir);
                return Err(LifecycleError::Spawn {
                    message: err.to_string(),
                });
            }
        };

        let mut record = AgentRecord::new(
            id.clone(),
            backend.clone(),
            project,
            model,
            now,
            self.registry.writer(),
        );
        record.external_ref = request.issue.clone();
        record.workspace_ref = Some(ws_dir.clone());
        record.skill = request.skill.clone();
        record.deliverables = deliverables;
        record.base_commit = base_commit;

        let record = match self.registry.register(record) {
            Ok(record) => record,
            Err(err) => {
                warn!(agent_id = %id, error = %err, "registration failed; rolling back spawned agent");
                self.rollback(&backend);
                remove_workspace(&ws_dir);
                return Err(err.into());
            }
        };
        info!(agent_id = %id, backend = %backend, "agent spawned");
        self.registry.record_event(Event::for_agent(
            &id,
            now,
            EventKind::AgentSpawned {
                backend: backend.to_string(),
            },
        ));

        self.tracker_call(&record, "mark in progress", |tracker, issue| {
            tracker.set_status(&record.project_path, issue, &IssueStatus::InProgress)
        });
        self.tracker_call(&record, "comment", |tracker, issue| {
            tracker.add_comment(
                &record.project_path,
                issue,
                &format!("orch: agent {id} started ({backend})"),
            )
        });
        Ok(record)
    }

    /// Reconcile, then list what matches `filter`.
    pub fn status(
        &self,
        filter: &AgentFilter,
    ) -> Result<(ReconcileReport, Vec<AgentRecord>), LifecycleError> {
        let report = self.reconciler().reconcile(filter)?;
        let records = self.registry.list(filter)?.collect();
        Ok((report, records))
    }

    /// Verify the agent's work, then mark it completed and tear it down.
    ///
    /// A refusal is returned as [`CompleteOutcome::Refused`] and changes
    /// nothing.
    pub fn complete(&self, id: &AgentId, force: bool) -> Result<CompleteOutcome, LifecycleError> {
        self.reconciler().reconcile(&AgentFilter::only(id))?;
        let record = self.load(id)?;
        if record.status == AgentStatus::Abandoned {
            return Err(LifecycleError::InvalidState {
                id: id.clone(),
                status: record.status,
                action: "complete",
            });
        }

        let verification = self.verifier().verify(&record, force);
        if !verification.ok {
            info!(agent_id = %id, force, "completion refused");
            self.registry.record_event(Event::for_agent(
                id,
                verification.checked_at,
                EventKind::VerificationRefused {
                    missing: verification
                        .missing
                        .iter()
                        .map(|condition| condition.code().to_string())
                        .collect(),
                },
            ));
            return Ok(CompleteOutcome::Refused(verification));
        }

        if record.status.is_active() {
            let reason = if force {
                "completion forced with committed work"
            } else {
                "verified complete"
            };
            self.registry.transition(
                id,
                AgentStatus::Active,
                AgentStatus::Completed,
                Some(reason.to_string()),
            )?;
        }
        let record = self.load(id)?;

        let (teardown, tombstoned) = if self.may_be_self(&record) {
            self.defer_teardown(&record)?;
            (TeardownOutcome::Deferred, false)
        } else {
            self.finish_verified(&record)?
        };
        let record = self.registry.get(id)?.unwrap_or(record);
        Ok(CompleteOutcome::Completed {
            record,
            verification,
            teardown,
            tombstoned,
        })
    }

    /// Give up on an active agent.
    ///
    /// The process is asked to exit; it is only killed outright when its
    /// work is already committed.
    pub fn abandon(&self, id: &AgentId, reason: &str) -> Result<AbandonOutcome, LifecycleError> {
        let record = self.load(id)?;
        let moved = self.registry.transition(
            id,
            AgentStatus::Active,
            AgentStatus::Abandoned,
            Some(reason.to_string()),
        )?;
        if moved.is_none() {
            return Err(LifecycleError::InvalidState {
                id: id.clone(),
                status: record.status,
                action: "abandon",
            });
        }
        let record = self.load(id)?;

        let teardown = if self.may_be_self(&record) {
            self.defer_teardown(&record)?;
            TeardownOutcome::Deferred
        } else {
            self.teardown_abandoned(&record)?
        };

        self.tracker_call(&record, "comment", |tracker, issue| {
            tracker.add_comment(
                &record.project_path,
                issue,
                &format!("orch: agent {id} abandoned: {reason}"),
            )
        });
        self.tracker_call(&record, "reopen", |tracker, issue| {
            tracker.set_status(&record.project_path, issue, &IssueStatus::Open)
        });

        Ok(AbandonOutcome {
            record: self.load(id)?,
            teardown,
        })
    }

    /// Type `text` into a running agent's window.
    pub fn send(&self, id: &AgentId, text: &str) -> Result<(), LifecycleError> {
        let record = self.load(id)?;
        if !record.status.is_active() {
            return Err(LifecycleError::InvalidState {
                id: id.clone(),
                status: record.status,
                action: "send input",
            });
        }
        let handle = self.window_of(&record, "input")?;
        self.probe.send_input(handle, text)?;
        Ok(())
    }

    /// Switch the terminal to the agent's window.
    pub fn focus(&self, id: &AgentId) -> Result<(), LifecycleError> {
        let record = self.load(id)?;
        let handle = self.window_of(&record, "focus")?;
        self.probe.focus(handle)?;
        Ok(())
    }

    /// Finish teardowns that were deferred by the agent's own process.
    pub fn sweep(&self) -> Result<SweepReport, LifecycleError> {
        let observer = self.probe.observer();
        let mut report = SweepReport::default();
        if observer.is_unknown() {
            warn!("cannot identify the current tmux window; sweep skipped");
            report.skipped_unknown_observer = true;
            return Ok(report);
        }

        let pending = self
            .registry
            .list(&AgentFilter::all())?
            .filter(|record| record.teardown_pending)
            .collect::<Vec<_>>();
        for record in pending {
            if record
                .process_handle()
                .is_some_and(|handle| observer.may_be(handle))
            {
                debug!(agent_id = %record.id, "skipping own window");
                report.skipped_self.push(record.id.clone());
                continue;
            }
            let outcome = if record.status == AgentStatus::Abandoned {
                self.teardown_abandoned(&record)?
            } else {
                self.finish_verified(&record)?.0
            };
            report.finished.push((record.id.clone(), outcome));
        }
        Ok(report)
    }

    /// Reconcile and sweep, tombstone finished agents whose process is gone,
    /// then optionally purge tombstones older than `purge_older_than`.
    pub fn clean(
        &self,
        purge_older_than: Option<ChronoDuration>,
    ) -> Result<CleanReport, LifecycleError> {
        let reconcile = self.reconciler().reconcile(&AgentFilter::all())?;
        let sweep = self.sweep()?;

        let finished = self
            .registry
            .list(&AgentFilter::all())?
            .filter(|record| record.status.is_terminal() && !record.teardown_pending)
            .collect::<Vec<_>>();
        let mut tombstoned = Vec::new();
        for record in finished {
            match self.is_running(&record.backend) {
                Ok(false) => {
                    self.registry.tombstone(&record.id)?;
                    tombstoned.push(record.id);
                }
                Ok(true) => debug!(agent_id = %record.id, "finished agent still running; kept"),
                Err(err) => warn!(agent_id = %record.id, error = %err, "cannot check agent process; kept"),
            }
        }

        let purged = match purge_older_than {
            Some(age) => self.registry.purge_tombstones(Utc::now() - age)?,
            None => Vec::new(),
        };
        Ok(CleanReport {
            reconcile,
            sweep,
            tombstoned,
            purged,
        })
    }

    /// Physically remove one tombstone.
    pub fn purge(&self, id: &AgentId) -> Result<AgentRecord, LifecycleError> {
        Ok(self.registry.purge(id)?)
    }

    fn load(&self, id: &AgentId) -> Result<AgentRecord, LifecycleError> {
        match self.registry.get(id)? {
            None => Err(LifecycleError::NotFound { id: id.clone() }),
            Some(record) if record.is_deleted() => {
                Err(LifecycleError::AlreadyDeleted { id: id.clone() })
            }
            Some(record) => Ok(record),
        }
    }

    fn verifier(&self) -> CompletionVerifier<'a> {
        CompletionVerifier::new(
            self.evidence,
            PathExclusions::new(self.config.verify.excluded_paths.iter().cloned()),
        )
    }

    fn window_of<'r>(
        &self,
        record: &'r AgentRecord,
        action: &'static str,
    ) -> Result<&'r ProcessHandle, LifecycleError> {
        record
            .process_handle()
            .ok_or_else(|| LifecycleError::UnsupportedBackend {
                id: record.id.clone(),
                backend: record.backend.as_str(),
                action,
            })
    }

    fn may_be_self(&self, record: &AgentRecord) -> bool {
        record
            .process_handle()
            .is_some_and(|handle| self.probe.observer().may_be(handle))
    }

    fn defer_teardown(&self, record: &AgentRecord) -> Result<(), LifecycleError> {
        self.registry.update(&record.id, |record| {
            record.teardown_pending = true;
            Ok(())
        })?;
        info!(agent_id = %record.id, "teardown deferred; run `orch sweep` from another terminal");
        self.registry.record_event(Event::for_agent(
            &record.id,
            Utc::now(),
            EventKind::TeardownDeferred,
        ));
        Ok(())
    }

    /// Tear down a record whose completion already passed verification,
    /// close its tracker issue, and tombstone it.
    fn finish_verified(
        &self,
        record: &AgentRecord,
    ) -> Result<(TeardownOutcome, bool), LifecycleError> {
        let outcome = self.teardown(record, true);
        if !outcome.is_gone() {
            self.mark_pending(record, true)?;
            return Ok((outcome, false));
        }

        self.tracker_call(record, "close", |tracker, issue| {
            tracker.close(
                &record.project_path,
                issue,
                &format!("completed by orch agent {}", record.id),
            )
        });
        self.registry.tombstone(&record.id)?;
        Ok((outcome, true))
    }

    fn teardown_abandoned(&self, record: &AgentRecord) -> Result<TeardownOutcome, LifecycleError> {
        let allow_force = self.verifier().verify(record, true).ok;
        let outcome = self.teardown(record, allow_force);
        self.mark_pending(record, !outcome.is_gone())?;
        Ok(outcome)
    }

    fn mark_pending(&self, record: &AgentRecord, pending: bool) -> Result<(), LifecycleError> {
        self.registry.update(&record.id, |record| {
            record.teardown_pending = pending;
            Ok(())
        })?;
        Ok(())
    }

    fn is_running(&self, backend: &AgentBackend) -> Result<bool, ProbeError> {
        match backend {
            AgentBackend::Process { handle } => self.probe.is_live(handle),
            AgentBackend::Api { session_ref } => self.api.is_session_live(session_ref),
        }
    }

    fn stop(&self, backend: &AgentBackend, graceful: bool) -> Result<(), ProbeError> {
        match backend {
            AgentBackend::Process { handle } => self.probe.terminate(handle, graceful),
            AgentBackend::Api { session_ref } => self.api.stop_session(session_ref, graceful),
        }
    }

    /// Ask the agent to exit, wait out the grace period, then kill it if
    /// `allow_force`.
    fn teardown(&self, record: &AgentRecord, allow_force: bool) -> TeardownOutcome {
        match self.is_running(&record.backend) {
            Ok(false) => return TeardownOutcome::AlreadyGone,
            Ok(true) => {}
            Err(err) => return TeardownOutcome::Failed(err.to_string()),
        }

        if let Err(err) = self.stop(&record.backend, true) {
            warn!(agent_id = %record.id, error = %err, "graceful shutdown request failed");
        }
        let outcome = if self.wait_until_gone(&record.backend) {
            TeardownOutcome::Graceful
        } else if !allow_force {
            warn!(agent_id = %record.id, "agent ignored shutdown request and has uncommitted work; left running");
            TeardownOutcome::LeftRunning
        } else {
            match self.stop(&record.backend, false) {
                Ok(()) => TeardownOutcome::Forced,
                Err(err) => TeardownOutcome::Failed(err.to_string()),
            }
        };

        if let TeardownOutcome::Graceful | TeardownOutcome::Forced = outcome {
            let forced = outcome == TeardownOutcome::Forced;
            info!(agent_id = %record.id, forced, "agent torn down");
            self.registry.record_event(Event::for_agent(
                &record.id,
                Utc::now(),
                EventKind::TornDown { forced },
            ));
        }
        outcome
    }

    fn wait_until_gone(&self, backend: &AgentBackend) -> bool {
        let grace = Duration::from_secs(self.config.shutdown.grace_secs);
        let poll = Duration::from_millis(self.config.shutdown.poll_interval_ms.max(1));
        let deadline = Instant::now() + grace;
        loop {
            match self.is_running(backend) {
                Ok(false) => return true,
                Ok(true) => {}
                Err(err) => debug!(backend = %backend, error = %err, "liveness check failed while waiting"),
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(poll.min(deadline - now));
        }
    }

    /// Stop an agent whose registration failed. Nothing has verified its
    /// work, so it is only asked to exit and never killed.
    fn rollback(&self, backend: &AgentBackend) {
        if let Err(err) = self.stop(backend, true) {
            warn!(backend = %backend, error = %err, "failed to stop unregistered agent");
            return;
        }
        if !self.wait_until_gone(backend) {
            warn!(backend = %backend, "unregistered agent ignored shutdown request; left running");
        }
    }

    /// Run a tracker call for the record's issue. Failures are logged and
    /// reported as `false`; they never fail the lifecycle operation.
    fn tracker_call<F>(&self, record: &AgentRecord, action: &str, call: F) -> bool
    where
        F: FnOnce(&dyn TrackerClient, &str) -> Result<(), TrackerError>,
    {
        let (Some(tracker), Some(issue)) = (self.tracker, record.external_ref.as_deref()) else {
            return false;
        };
        match call(tracker, issue) {
            Ok(()) => true,
            Err(err) => {
                warn!(agent_id = %record.id, issue, action, error = %err, "tracker unavailable");
                self.registry.record_event(Event::for_agent(
                    &record.id,
                    Utc::now(),
                    EventKind::TrackerUnavailable {
                        message: err.to_string(),
                    },
                ));
                false
            }
        }
    }
}

fn default_prompt(task: &str, workspace: &Path) -> String {
    format!(
        "{task}\n\nKeep notes in {}. When the task is finished and committed, add the line `Phase: Complete` to that file.",
        workspace.join(WORKSPACE_FILE).display()
    )
}

fn remove_workspace(dir: &Path) {
    if let Err(err) = fs::remove_dir_all(dir) {
        warn!(path = %dir.display(), error = %err, "failed to remove workspace");
    }
}
