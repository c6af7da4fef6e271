//! Detached agents without a multiplexer window, addressed as
//! `pid:<n>:<start>`.
//!
//! The start time (clock ticks since boot, from `/proc/<pid>/stat`) pins the
//! reference to one process, so a recycled pid reads as a dead agent and is
//! never signalled. References written as plain `pid:<n>` carry no start
//! time and are trusted on the pid alone.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use crate::error::ProbeError;
use crate::probe::ApiSessionProbe;
use crate::types::AgentCommand;
use crate::util::render_shell_invocation;

const SESSION_REF_PREFIX: &str = "pid:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessProbe {
    pub shell: String,
}

impl Default for HeadlessProbe {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
        }
    }
}

impl HeadlessProbe {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

/// A parsed headless session reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRef {
    pub pid: u32,
    pub started: Option<u64>,
}

impl std::fmt::Display for SessionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.started {
            Some(started) => write!(f, "{SESSION_REF_PREFIX}{}:{started}", self.pid),
            None => write!(f, "{SESSION_REF_PREFIX}{}", self.pid),
        }
    }
}

impl SessionRef {
    /// Reference to a running process, stamped with its start time when the
    /// host exposes one.
    pub fn for_pid(pid: u32) -> Self {
        Self {
            pid,
            started: process_start_time(pid),
        }
    }

    /// Whether `pid` still names the process this reference was taken from.
    fn matches_running(&self) -> bool {
        match self.started {
            None => true,
            Some(expected) => process_start_time(self.pid) == Some(expected),
        }
    }
}

pub fn session_ref_for(pid: u32) -> String {
    SessionRef::for_pid(pid).to_string()
}

pub fn parse_session_ref(session_ref: &str) -> Result<SessionRef, ProbeError> {
    let invalid = || ProbeError::InvalidSessionRef {
        session_ref: session_ref.to_string(),
    };
    let raw = session_ref.strip_prefix(SESSION_REF_PREFIX).ok_or_else(invalid)?;
    let (pid, started) = match raw.trim().split_once(':') {
        Some((pid, started)) => (pid, Some(started.parse::<u64>().map_err(|_| invalid())?)),
        None => (raw.trim(), None),
    };
    let pid = pid
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 1 && *pid <= i32::MAX as u32)
        .ok_or_else(invalid)?;
    Ok(SessionRef { pid, started })
}

/// Field 22 of `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn process_start_time(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_start_time(&stat)
}

#[cfg(not(target_os = "linux"))]
fn process_start_time(_pid: u32) -> Option<u64> {
    None
}

/// The command name may hold spaces and parentheses, so fields are counted
/// from the last `)`, where field 3 begins.
fn parse_start_time(stat: &str) -> Option<u64> {
    let rest = stat.get(stat.rfind(')')? + 1..)?;
    rest.split_whitespace().nth(22 - 3)?.parse().ok()
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks that the process exists.
    let result = unsafe { libc::kill(pid as i32, 0) };
    let exists = result == 0
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // Format: pid (comm) state ...
    stat.rfind(')')
        .and_then(|end| stat.get(end + 2..))
        .and_then(|rest| rest.chars().next())
        == Some('Z')
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Signal the agent's whole process group; a missing group is not an error.
#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) -> Result<(), ProbeError> {
    // SAFETY: a negative pid addresses the process group led by `pid`.
    let result = unsafe { libc::kill(-(pid as i32), signal) };
    if result == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(ProbeError::Signal { pid, source: err })
}

#[cfg(not(unix))]
fn signal_group(pid: u32, _signal: i32) -> Result<(), ProbeError> {
    Err(ProbeError::Signal {
        pid,
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "headless agents require a unix host",
        ),
    })
}

impl ApiSessionProbe for HeadlessProbe {
    fn is_session_live(&self, session_ref: &str) -> Result<bool, ProbeError> {
        let parsed = parse_session_ref(session_ref)?;
        if !pid_alive(parsed.pid) {
            return Ok(false);
        }
        if !parsed.matches_running() {
            debug!(session_ref, "pid now belongs to another process");
            return Ok(false);
        }
        Ok(true)
    }

    fn stop_session(&self, session_ref: &str, graceful: bool) -> Result<(), ProbeError> {
        let parsed = parse_session_ref(session_ref)?;
        if !parsed.matches_running() {
            warn!(session_ref, "not signalling: pid was reused or the agent already exited");
            return Ok(());
        }
        #[cfg(unix)]
        let signal = if graceful { libc::SIGTERM } else { libc::SIGKILL };
        #[cfg(not(unix))]
        let signal = i32::from(graceful);
        debug!(pid = parsed.pid, graceful, "signalling headless agent");
        signal_group(parsed.pid, signal)
    }

    fn spawn_session(
        &self,
        project_path: &Path,
        command: &AgentCommand,
        log_path: &Path,
    ) -> Result<String, ProbeError> {
        if let Some(parent) = log_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| ProbeError::Spawn {
                message: format!("cannot create log directory {}: {err}", parent.display()),
            })?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|err| ProbeError::Spawn {
                message: format!("cannot open agent log {}: {err}", log_path.display()),
            })?;
        let log_err = log.try_clone().map_err(|err| ProbeError::Spawn {
            message: format!("cannot duplicate agent log handle: {err}"),
        })?;

        let script = render_shell_invocation(project_path, command);
        let mut launcher = Command::new(&self.shell);
        launcher
            .arg("-c")
            .arg(&script)
            .current_dir(project_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            launcher.process_group(0);
        }

        let child = launcher.spawn().map_err(|err| ProbeError::Spawn {
            message: format!("{} -c {script}: {err}", self.shell),
        })?;
        let session_ref = session_ref_for(child.id());
        info!(session_ref = %session_ref, executable = %command.executable, "spawned headless agent");
        Ok(session_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_refs_parse_with_and_without_start_time() {
        let stamped = parse_session_ref("pid:4242:981234").expect("parse");
        assert_eq!(
            stamped,
            SessionRef {
                pid: 4242,
                started: Some(981234)
            }
        );
        assert_eq!(stamped.to_string(), "pid:4242:981234");

        let plain = parse_session_ref("pid:4242").expect("parse");
        assert_eq!(plain.started, None);
        assert_eq!(plain.to_string(), "pid:4242");

        for bad in ["4242", "pid:", "pid:abc", "pid:0", "pid:1", "pid:42:", "pid:42:x", "tmux:@1"] {
            let err = parse_session_ref(bad).expect_err("invalid ref");
            assert!(matches!(err, ProbeError::InvalidSessionRef { .. }), "{bad}");
        }
    }

    #[test]
    fn start_time_is_read_past_a_command_name_with_spaces() {
        let stat = "4242 (agent (v2) x) S 1 4242 4242 0 -1 4194560 120 0 0 0 3 1 0 0 20 0 1 0 981234 2000 100";
        assert_eq!(parse_start_time(stat), Some(981234));
        assert_eq!(parse_start_time("4242 (short) S 1"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn recycled_pid_reads_as_dead_and_is_not_signalled() {
        let own = SessionRef::for_pid(std::process::id());
        let started = own.started.expect("linux exposes start time");
        let probe = HeadlessProbe::default();

        assert!(probe.is_session_live(&own.to_string()).expect("liveness"));

        let recycled = SessionRef {
            started: Some(started + 1),
            ..own
        };
        assert!(!probe.is_session_live(&recycled.to_string()).expect("liveness"));
        // Signalling would kill this test process; returning at all proves it did not.
        probe
            .stop_session(&recycled.to_string(), false)
            .expect("mismatch is not an error");
    }

    #[test]
    fn invalid_ref_is_reported_not_treated_as_dead() {
        let probe = HeadlessProbe::default();
        assert!(probe.is_session_live("not-a-ref").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn spawned_session_is_live_until_killed() {
        use std::time::{Duration, Instant};

        let dir = tempfile::tempdir().expect("tempdir");
        let probe = HeadlessProbe::new("sh");
        let command = AgentCommand {
            executable: "sleep".to_string(),
            args: vec!["30".to_string()],
            env: Vec::new(),
        };

        let session_ref = probe
            .spawn_session(dir.path(), &command, &dir.path().join("logs/agent.log"))
            .expect("spawn headless agent");
        let parsed = parse_session_ref(&session_ref).expect("parse");
        assert!(parsed.started.is_some(), "{session_ref}");
        assert!(probe.is_session_live(&session_ref).expect("liveness"));

        probe.stop_session(&session_ref, false).expect("kill");
        let deadline = Instant::now() + Duration::from_secs(5);
        while probe.is_session_live(&session_ref).expect("liveness") {
            assert!(Instant::now() < deadline, "agent still alive after SIGKILL");
            std::thread::sleep(Duration::from_millis(20));
        }

        // Stopping an already-gone agent is fine.
        probe.stop_session(&session_ref, true).expect("idempotent stop");
        assert!(dir.path().join("logs/agent.log").exists());
    }
}
