//! In-memory probe, tracker and evidence doubles for controller tests.

use chrono::{DateTime, Utc};
use orch_agents::{AgentCommand, ApiSessionProbe, Observer, ProbeError, ProcessProbe, SessionScope};
use orch_beads::{IssueStatus, TrackerClient, TrackerError, TrackerIssue};
use orch_core::types::ProcessHandle;
use orch_git::CommitSummary;
use orch_verify::{VerifyError, WorkEvidence};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

pub struct FakeProcessProbe {
    pub live: RefCell<BTreeSet<ProcessHandle>>,
    pub observer: RefCell<Observer>,
    pub fail_listing: Cell<bool>,
    pub fail_spawn: Cell<bool>,
    /// Windows ignore the exit input and only die when killed.
    pub ignore_graceful: Cell<bool>,
    pub calls: RefCell<Vec<String>>,
    next_window: Cell<u32>,
}

impl FakeProcessProbe {
    pub fn new() -> Self {
        Self {
            live: RefCell::new(BTreeSet::new()),
            observer: RefCell::new(Observer::Outside),
            fail_listing: Cell::new(false),
            fail_spawn: Cell::new(false),
            ignore_graceful: Cell::new(false),
            calls: RefCell::new(Vec::new()),
            next_window: Cell::new(1),
        }
    }

    pub fn add_live(&self, handle: &ProcessHandle) {
        self.live.borrow_mut().insert(handle.clone());
    }

    pub fn set_observer(&self, observer: Observer) {
        *self.observer.borrow_mut() = observer;
    }

    /// Calls that change or focus a window.
    pub fn side_effects(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|call| !call.starts_with("list"))
            .cloned()
            .collect()
    }
}

impl ProcessProbe for FakeProcessProbe {
    fn list_live_handles(
        &self,
        scope: &SessionScope,
    ) -> Result<BTreeSet<ProcessHandle>, ProbeError> {
        self.calls.borrow_mut().push(format!("list {scope:?}"));
        if self.fail_listing.get() {
            return Err(ProbeError::Parse {
                context: "tmux server unreachable".to_string(),
            });
        }
        let live = self.live.borrow();
        Ok(match scope {
            SessionScope::All => live.clone(),
            SessionScope::Session(session) => live
                .iter()
                .filter(|handle| &handle.session == session)
                .cloned()
                .collect(),
        })
    }

    fn spawn_handle(
        &self,
        session: &str,
        name: &str,
        _project_path: &Path,
        command: &AgentCommand,
    ) -> Result<ProcessHandle, ProbeError> {
        self.calls
            .borrow_mut()
            .push(format!("spawn {session} {name} {}", command.executable));
        if self.fail_spawn.get() {
            return Err(ProbeError::Spawn {
                message: "no tmux server".to_string(),
            });
        }
        let idx = self.next_window.get();
        self.next_window.set(idx + 1);
        let handle = ProcessHandle::new(session, format!("@{idx}"));
        self.add_live(&handle);
        Ok(handle)
    }

    fn send_input(&self, handle: &ProcessHandle, text: &str) -> Result<(), ProbeError> {
        self.calls.borrow_mut().push(format!("send {handle} {text}"));
        Ok(())
    }

    fn terminate(&self, handle: &ProcessHandle, graceful: bool) -> Result<(), ProbeError> {
        let mode = if graceful { "graceful" } else { "forced" };
        self.calls
            .borrow_mut()
            .push(format!("terminate {mode} {handle}"));
        if !graceful || !self.ignore_graceful.get() {
            self.live
                .borrow_mut()
                .retain(|candidate| !candidate.same_window(handle));
        }
        Ok(())
    }

    fn focus(&self, handle: &ProcessHandle) -> Result<(), ProbeError> {
        self.calls.borrow_mut().push(format!("focus {handle}"));
        Ok(())
    }

    fn observer(&self) -> Observer {
        self.observer.borrow().clone()
    }
}

pub struct FakeApiProbe {
    pub live: RefCell<BTreeSet<String>>,
    pub fail: Cell<bool>,
    pub calls: RefCell<Vec<String>>,
    next_pid: Cell<u32>,
}

impl FakeApiProbe {
    pub fn new() -> Self {
        Self {
            live: RefCell::new(BTreeSet::new()),
            fail: Cell::new(false),
            calls: RefCell::new(Vec::new()),
            next_pid: Cell::new(4000),
        }
    }

    pub fn side_effects(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|call| !call.starts_with("live"))
            .cloned()
            .collect()
    }
}

impl ApiSessionProbe for FakeApiProbe {
    fn is_session_live(&self, session_ref: &str) -> Result<bool, ProbeError> {
        self.calls.borrow_mut().push(format!("live {session_ref}"));
        if self.fail.get() {
            return Err(ProbeError::InvalidSessionRef {
                session_ref: session_ref.to_string(),
            });
        }
        Ok(self.live.borrow().contains(session_ref))
    }

    fn stop_session(&self, session_ref: &str, graceful: bool) -> Result<(), ProbeError> {
        let mode = if graceful { "graceful" } else { "forced" };
        self.calls
            .borrow_mut()
            .push(format!("stop {mode} {session_ref}"));
        self.live.borrow_mut().remove(session_ref);
        Ok(())
    }

    fn spawn_session(
        &self,
        _project_path: &Path,
        command: &AgentCommand,
        _log_path: &Path,
    ) -> Result<String, ProbeError> {
        self.calls
            .borrow_mut()
            .push(format!("spawn {}", command.executable));
        let pid = self.next_pid.get();
        self.next_pid.set(pid + 1);
        let session_ref = format!("pid:{pid}");
        self.live.borrow_mut().insert(session_ref.clone());
        Ok(session_ref)
    }
}

#[derive(Default)]
pub struct FakeTracker {
    pub issues: RefCell<BTreeMap<String, TrackerIssue>>,
    pub fail: Cell<bool>,
    pub calls: RefCell<Vec<String>>,
}

impl FakeTracker {
    pub fn with_issue(issue: TrackerIssue) -> Self {
        let tracker = Self::default();
        tracker.issues.borrow_mut().insert(issue.id.clone(), issue);
        tracker
    }

    fn check(&self, command: String) -> Result<(), TrackerError> {
        self.calls.borrow_mut().push(command.clone());
        if self.fail.get() {
            return Err(TrackerError::Timeout {
                command,
                timeout: Duration::from_secs(15),
            });
        }
        Ok(())
    }
}

pub fn issue(id: &str, status: IssueStatus) -> TrackerIssue {
    TrackerIssue {
        id: id.to_string(),
        title: None,
        status,
        comments: Vec::new(),
    }
}

impl TrackerClient for FakeTracker {
    fn get_issue(&self, _project: &Path, issue_ref: &str) -> Result<TrackerIssue, TrackerError> {
        self.check(format!("show {issue_ref}"))?;
        self.issues
            .borrow()
            .get(issue_ref)
            .cloned()
            .ok_or_else(|| TrackerError::Parse {
                message: format!("no issue {issue_ref}"),
            })
    }

    fn set_status(
        &self,
        _project: &Path,
        issue_ref: &str,
        status: &IssueStatus,
    ) -> Result<(), TrackerError> {
        self.check(format!("status {issue_ref} {status}"))
    }

    fn close(&self, _project: &Path, issue_ref: &str, _reason: &str) -> Result<(), TrackerError> {
        self.check(format!("close {issue_ref}"))
    }

    fn add_comment(
        &self,
        _project: &Path,
        issue_ref: &str,
        _text: &str,
    ) -> Result<(), TrackerError> {
        self.check(format!("comment {issue_ref}"))
    }
}

#[derive(Default)]
pub struct FakeEvidence {
    pub commits: Vec<CommitSummary>,
    pub dirty: Vec<String>,
    pub head: Option<String>,
}

impl FakeEvidence {
    pub fn committed() -> Self {
        Self {
            commits: vec![CommitSummary {
                sha: "abc1234def".to_string(),
                subject: "agent work".to_string(),
            }],
            ..Self::default()
        }
    }
}

impl WorkEvidence for FakeEvidence {
    fn commits_since(
        &self,
        _project: &Path,
        _base: Option<&str>,
        _since: DateTime<Utc>,
    ) -> Result<Vec<CommitSummary>, VerifyError> {
        Ok(self.commits.clone())
    }

    fn uncommitted_paths(&self, _project: &Path) -> Result<Vec<String>, VerifyError> {
        Ok(self.dirty.clone())
    }

    fn head(&self, _project: &Path) -> Result<Option<String>, VerifyError> {
        Ok(self.head.clone())
    }
}
