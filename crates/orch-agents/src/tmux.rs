//! tmux-backed [`ProcessProbe`].

use orch_core::types::ProcessHandle;
use std::collections::BTreeSet;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::ProbeError;
use crate::probe::{Observer, ProcessProbe, SessionScope};
use crate::types::AgentCommand;
use crate::util::render_shell_invocation;

const WINDOW_FORMAT: &str = "#{session_name}\t#{window_id}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxCli {
    pub binary: PathBuf,
}

impl Default for TmuxCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tmux"),
        }
    }
}

impl TmuxCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn run<I, S>(&self, args: I) -> Result<TmuxOutput, ProbeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let owned_args: Vec<OsString> = args
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect();

        let mut command = Command::new(&self.binary);
        command.args(&owned_args);

        let rendered = render_command(&self.binary, &owned_args);
        debug!(command = %rendered, "running tmux");
        let output = command.output().map_err(|source| ProbeError::Io {
            command: rendered.clone(),
            source,
        })?;

        let stdout =
            String::from_utf8(output.stdout).map_err(|source| ProbeError::NonUtf8Output {
                command: rendered.clone(),
                stream: "stdout",
                source,
            })?;
        let stderr =
            String::from_utf8(output.stderr).map_err(|source| ProbeError::NonUtf8Output {
                command: rendered.clone(),
                stream: "stderr",
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::CommandFailed {
                command: rendered,
                status: output.status.code(),
                stdout,
                stderr,
            });
        }

        Ok(TmuxOutput { stdout, stderr })
    }
}

fn render_command(binary: &Path, args: &[OsString]) -> String {
    let mut rendered = binary.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

/// The server, session or window being asked about does not exist.
pub fn is_missing_target(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    [
        "no server running",
        "error connecting to",
        "can't find session",
        "can't find window",
        "session not found",
        "no such file or directory",
    ]
    .iter()
    .any(|needle| lowered.contains(needle))
}

pub fn parse_window_list(stdout: &str) -> Result<BTreeSet<ProcessHandle>, ProbeError> {
    let mut handles = BTreeSet::new();
    for line in stdout.lines().map(str::trim_end).filter(|line| !line.is_empty()) {
        let (session, window) = line.split_once('\t').ok_or_else(|| ProbeError::Parse {
            context: format!("expected '<session>\\t<window>' in tmux output, got {line:?}"),
        })?;
        if session.is_empty() || window.is_empty() {
            return Err(ProbeError::Parse {
                context: format!("empty session or window in tmux output line {line:?}"),
            });
        }
        handles.insert(ProcessHandle::new(session, window));
    }
    Ok(handles)
}

/// tmux target for a handle. Window ids are server-unique; names are pinned
/// to an exact session match.
pub fn target_for(handle: &ProcessHandle) -> String {
    if handle.window.starts_with('@') {
        handle.window.clone()
    } else {
        format!("={}:{}", handle.session, handle.window)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxProbe {
    pub cli: TmuxCli,
    /// Text typed into a window to ask the agent to quit.
    pub exit_input: String,
}

impl Default for TmuxProbe {
    fn default() -> Self {
        Self {
            cli: TmuxCli::default(),
            exit_input: "/exit".to_string(),
        }
    }
}

impl TmuxProbe {
    pub fn new(binary: impl Into<PathBuf>, exit_input: impl Into<String>) -> Self {
        Self {
            cli: TmuxCli::new(binary),
            exit_input: exit_input.into(),
        }
    }

    pub fn has_session(&self, session: &str) -> Result<bool, ProbeError> {
        let target = format!("={session}");
        match self.cli.run(["has-session", "-t", target.as_str()]) {
            Ok(_) => Ok(true),
            Err(ProbeError::CommandFailed { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Resolve the observer from the values of `$TMUX` and `$TMUX_PANE`.
    pub fn observer_from(&self, tmux: Option<&OsStr>, pane: Option<&str>) -> Observer {
        if tmux.map_or(true, OsStr::is_empty) {
            return Observer::Outside;
        }
        let Some(pane) = pane.filter(|pane| !pane.is_empty()) else {
            return Observer::Unknown;
        };

        match self
            .cli
            .run(["display-message", "-p", "-t", pane, WINDOW_FORMAT])
            .and_then(|output| parse_window_list(&output.stdout))
        {
            Ok(handles) if handles.len() == 1 => handles
                .into_iter()
                .next()
                .map(Observer::Inside)
                .unwrap_or(Observer::Unknown),
            Ok(handles) => {
                debug!(count = handles.len(), "ambiguous tmux observer");
                Observer::Unknown
            }
            Err(err) => {
                debug!(error = %err, "could not resolve current tmux window");
                Observer::Unknown
            }
        }
    }

    fn new_window(
        &self,
        session: &str,
        name: &str,
        project_path: &Path,
        script: &str,
    ) -> Result<TmuxOutput, ProbeError> {
        let target = format!("={session}:");
        let cwd = project_path.to_string_lossy().into_owned();
        self.cli.run([
            "new-window",
            "-d",
            "-t",
            target.as_str(),
            "-n",
            name,
            "-c",
            cwd.as_str(),
            "-P",
            "-F",
            "#{window_id}",
            script,
        ])
    }

    fn new_session(
        &self,
        session: &str,
        name: &str,
        project_path: &Path,
        script: &str,
    ) -> Result<TmuxOutput, ProbeError> {
        let cwd = project_path.to_string_lossy().into_owned();
        self.cli.run([
            "new-session",
            "-d",
            "-s",
            session,
            "-n",
            name,
            "-c",
            cwd.as_str(),
            "-P",
            "-F",
            "#{window_id}",
            script,
        ])
    }
}

impl ProcessProbe for TmuxProbe {
    fn list_live_handles(
        &self,
        scope: &SessionScope,
    ) -> Result<BTreeSet<ProcessHandle>, ProbeError> {
        let result = match scope {
            SessionScope::All => self.cli.run(["list-windows", "-a", "-F", WINDOW_FORMAT]),
            SessionScope::Session(session) => {
                let target = format!("={session}");
                self.cli
                    .run(["list-windows", "-t", target.as_str(), "-F", WINDOW_FORMAT])
            }
        };

        let output = match result {
            Ok(output) => output,
            Err(ProbeError::CommandFailed { stderr, .. }) if is_missing_target(&stderr) => {
                return Ok(BTreeSet::new());
            }
            Err(err) => return Err(err),
        };

        let mut handles = parse_window_list(&output.stdout)?;
        if let SessionScope::Session(session) = scope {
            handles.retain(|handle| &handle.session == session);
        }
        Ok(handles)
    }

    fn spawn_handle(
        &self,
        session: &str,
        name: &str,
        project_path: &Path,
        command: &AgentCommand,
    ) -> Result<ProcessHandle, ProbeError> {
        let script = render_shell_invocation(project_path, command);

        let output = if self.has_session(session)? {
            self.new_window(session, name, project_path, &script)?
        } else {
            match self.new_session(session, name, project_path, &script) {
                Ok(output) => output,
                // Another process created the session between the check and now.
                Err(ProbeError::CommandFailed { stderr, .. })
                    if stderr.contains("duplicate session") =>
                {
                    self.new_window(session, name, project_path, &script)?
                }
                Err(err) => return Err(err),
            }
        };

        let window = output.stdout.trim();
        if !window.starts_with('@') {
            return Err(ProbeError::Parse {
                context: format!("expected a window id from tmux, got {window:?}"),
            });
        }
        Ok(ProcessHandle::new(session, window))
    }

    fn send_input(&self, handle: &ProcessHandle, text: &str) -> Result<(), ProbeError> {
        let target = target_for(handle);
        self.cli.run(["send-keys", "-t", target.as_str(), "-l", text])?;
        self.cli.run(["send-keys", "-t", target.as_str(), "Enter"])?;
        Ok(())
    }

    fn terminate(&self, handle: &ProcessHandle, graceful: bool) -> Result<(), ProbeError> {
        if graceful {
            return self.send_input(handle, &self.exit_input);
        }
        let target = target_for(handle);
        match self.cli.run(["kill-window", "-t", target.as_str()]) {
            Ok(_) => Ok(()),
            Err(ProbeError::CommandFailed { stderr, .. }) if is_missing_target(&stderr) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn focus(&self, handle: &ProcessHandle) -> Result<(), ProbeError> {
        let target = target_for(handle);
        self.cli.run(["select-window", "-t", target.as_str()])?;
        Ok(())
    }

    fn observer(&self) -> Observer {
        let tmux = std::env::var_os("TMUX");
        let pane = std::env::var("TMUX_PANE").ok();
        self.observer_from(tmux.as_deref(), pane.as_deref())
    }
}
