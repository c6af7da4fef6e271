//! Traits over the things that actually host agents.
//!
//! The reconciler only ever calls the read-only half of these traits
//! (`list_live_handles`, `is_session_live`, `observer`); anything that
//! destroys or focuses a process is reserved for the lifecycle controller.

use orch_core::types::ProcessHandle;
use std::collections::BTreeSet;
use std::path::Path;

use crate::error::ProbeError;
use crate::types::AgentCommand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionScope {
    /// Every session on the multiplexer server.
    All,
    Session(String),
}

/// Where the calling process itself runs relative to agent windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observer {
    /// Not inside the multiplexer at all.
    Outside,
    /// Inside the given window.
    Inside(ProcessHandle),
    /// Inside the multiplexer, but the current window could not be resolved.
    Unknown,
}

impl Observer {
    /// True when acting on `handle` could affect the caller itself.
    ///
    /// An unresolvable observer is treated as possibly being any window.
    pub fn may_be(&self, handle: &ProcessHandle) -> bool {
        match self {
            Observer::Outside => false,
            Observer::Inside(own) => own.same_window(handle),
            Observer::Unknown => true,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Observer::Unknown)
    }
}

pub trait ProcessProbe {
    fn list_live_handles(&self, scope: &SessionScope)
        -> Result<BTreeSet<ProcessHandle>, ProbeError>;

    fn spawn_handle(
        &self,
        session: &str,
        name: &str,
        project_path: &Path,
        command: &AgentCommand,
    ) -> Result<ProcessHandle, ProbeError>;

    fn send_input(&self, handle: &ProcessHandle, text: &str) -> Result<(), ProbeError>;

    /// Graceful asks the agent to exit; otherwise the window is killed.
    fn terminate(&self, handle: &ProcessHandle, graceful: bool) -> Result<(), ProbeError>;

    fn focus(&self, handle: &ProcessHandle) -> Result<(), ProbeError>;

    fn observer(&self) -> Observer;

    fn is_live(&self, handle: &ProcessHandle) -> Result<bool, ProbeError> {
        let scope = if handle.has_window_id() {
            SessionScope::All
        } else {
            SessionScope::Session(handle.session.clone())
        };
        let live = self.list_live_handles(&scope)?;
        Ok(live.iter().any(|candidate| candidate.same_window(handle)))
    }
}

/// Agents that run without a window and are addressed by a session reference.
pub trait ApiSessionProbe {
    fn is_session_live(&self, session_ref: &str) -> Result<bool, ProbeError>;

    fn stop_session(&self, session_ref: &str, graceful: bool) -> Result<(), ProbeError>;

    /// Start a detached agent, sending its output to `log_path`.
    fn spawn_session(
        &self,
        project_path: &Path,
        command: &AgentCommand,
        log_path: &Path,
    ) -> Result<String, ProbeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outside_observer_never_matches() {
        let handle = ProcessHandle::new("orch-api", "@1");
        assert!(!Observer::Outside.may_be(&handle));
    }

    #[test]
    fn inside_observer_matches_only_its_window() {
        let own = ProcessHandle::new("orch-api", "@1");
        let observer = Observer::Inside(own.clone());
        assert!(observer.may_be(&own));
        assert!(!observer.may_be(&ProcessHandle::new("orch-api", "@2")));
    }

    #[test]
    fn inside_observer_follows_window_id_across_session_rename() {
        let observer = Observer::Inside(ProcessHandle::new("renamed", "@4"));
        assert!(observer.may_be(&ProcessHandle::new("orch-api", "@4")));
        assert!(!observer.may_be(&ProcessHandle::new("orch-api", "@5")));
    }

    struct Listing(BTreeSet<ProcessHandle>);

    impl ProcessProbe for Listing {
        fn list_live_handles(
            &self,
            scope: &SessionScope,
        ) -> Result<BTreeSet<ProcessHandle>, ProbeError> {
            Ok(self
                .0
                .iter()
                .filter(|handle| match scope {
                    SessionScope::All => true,
                    SessionScope::Session(session) => &handle.session == session,
                })
                .cloned()
                .collect())
        }

        fn spawn_handle(
            &self,
            _session: &str,
            _name: &str,
            _project_path: &Path,
            _command: &AgentCommand,
        ) -> Result<ProcessHandle, ProbeError> {
            Err(ProbeError::Spawn {
                message: "listing only".to_string(),
            })
        }

        fn send_input(&self, _handle: &ProcessHandle, _text: &str) -> Result<(), ProbeError> {
            Ok(())
        }

        fn terminate(&self, _handle: &ProcessHandle, _graceful: bool) -> Result<(), ProbeError> {
            Ok(())
        }

        fn focus(&self, _handle: &ProcessHandle) -> Result<(), ProbeError> {
            Ok(())
        }

        fn observer(&self) -> Observer {
            Observer::Outside
        }
    }

    #[test]
    fn is_live_finds_window_moved_to_another_session() {
        let probe = Listing(BTreeSet::from([
            ProcessHandle::new("renamed", "@7"),
            ProcessHandle::new("orch-api", "agent"),
        ]));
        assert!(probe
            .is_live(&ProcessHandle::new("orch-api", "@7"))
            .expect("live"));
        assert!(!probe
            .is_live(&ProcessHandle::new("orch-api", "@8"))
            .expect("gone"));
        assert!(probe
            .is_live(&ProcessHandle::new("orch-api", "agent"))
            .expect("named window"));
        assert!(!probe
            .is_live(&ProcessHandle::new("orch-web", "agent"))
            .expect("named window in another session"));
    }

    #[test]
    fn unknown_observer_matches_everything() {
        let observer = Observer::Unknown;
        assert!(observer.is_unknown());
        assert!(observer.may_be(&ProcessHandle::new("orch-web", "@9")));
    }
}
