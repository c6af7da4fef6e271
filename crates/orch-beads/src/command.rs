use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::TrackerError;

/// The only `bd` invocations the orchestrator is allowed to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllowedTrackerCommand {
    Show,
    ListComments,
    UpdateStatus,
    Close,
    AddComment,
}

const SETTABLE_STATUSES: [&str; 4] = ["open", "in_progress", "blocked", "closed"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeadsOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeadsCli {
    pub binary: PathBuf,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for BeadsCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("bd"),
            timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(20),
        }
    }
}

impl BeadsCli {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            ..Self::default()
        }
    }

    pub fn run_allowed<I, S>(
        &self,
        cwd: &Path,
        allowed: AllowedTrackerCommand,
        args: I,
    ) -> Result<BeadsOutput, TrackerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let owned_args: Vec<OsString> = args
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect();
        validate_contract(allowed, &owned_args)?;
        self.run_with_timeout(cwd, &owned_args)
    }

    /// Run the binary, killing it once `timeout` elapses.
    pub(crate) fn run_with_timeout(
        &self,
        cwd: &Path,
        args: &[OsString],
    ) -> Result<BeadsOutput, TrackerError> {
        let rendered = render_command(&self.binary, args);
        debug!(command = %rendered, "running tracker");

        let mut child = Command::new(&self.binary)
            .current_dir(cwd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| TrackerError::Io {
                command: rendered.clone(),
                source,
            })?;

        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!(command = %rendered, timeout = ?self.timeout, "tracker call timed out");
                    return Err(TrackerError::Timeout {
                        command: rendered,
                        timeout: self.timeout,
                    });
                }
                Ok(None) => thread::sleep(self.poll_interval),
                Err(source) => {
                    let _ = child.kill();
                    return Err(TrackerError::Io {
                        command: rendered,
                        source,
                    });
                }
            }
        };

        let stdout = String::from_utf8(join_reader(stdout_reader)).map_err(|source| {
            TrackerError::NonUtf8Output {
                command: rendered.clone(),
                stream: "stdout",
                source,
            }
        })?;
        let stderr = String::from_utf8(join_reader(stderr_reader)).map_err(|source| {
            TrackerError::NonUtf8Output {
                command: rendered.clone(),
                stream: "stderr",
                source,
            }
        })?;

        if !status.success() {
            return Err(TrackerError::CommandFailed {
                command: rendered,
                status: status.code(),
                stdout,
                stderr,
            });
        }

        Ok(BeadsOutput { stdout, stderr })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn validate_contract(
    allowed: AllowedTrackerCommand,
    args: &[OsString],
) -> Result<(), TrackerError> {
    let ok = match allowed {
        AllowedTrackerCommand::Show => {
            args.len() == 3 && arg_eq(args, 0, "show") && is_issue_ref(args, 1) && arg_eq(args, 2, "--json")
        }
        AllowedTrackerCommand::ListComments => {
            args.len() == 3
                && arg_eq(args, 0, "comments")
                && is_issue_ref(args, 1)
                && arg_eq(args, 2, "--json")
        }
        AllowedTrackerCommand::UpdateStatus => {
            args.len() == 4
                && arg_eq(args, 0, "update")
                && is_issue_ref(args, 1)
                && arg_eq(args, 2, "--status")
                && SETTABLE_STATUSES.contains(&arg_at(args, 3).as_str())
        }
        AllowedTrackerCommand::Close => {
            args.len() == 4
                && arg_eq(args, 0, "close")
                && is_issue_ref(args, 1)
                && arg_eq(args, 2, "--reason")
                && !arg_at(args, 3).trim().is_empty()
        }
        AllowedTrackerCommand::AddComment => {
            args.len() == 4
                && arg_eq(args, 0, "comments")
                && arg_eq(args, 1, "add")
                && is_issue_ref(args, 2)
                && !arg_at(args, 3).trim().is_empty()
        }
    };

    if ok {
        return Ok(());
    }

    Err(TrackerError::ContractViolation {
        message: format!("disallowed automated tracker invocation: {:?}", args),
    })
}

/// Issue ids are single tokens; anything that looks like a flag is refused.
fn is_issue_ref(args: &[OsString], idx: usize) -> bool {
    let value = arg_at(args, idx);
    !value.is_empty()
        && !value.starts_with('-')
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
}

fn arg_eq(args: &[OsString], idx: usize, expected: &str) -> bool {
    arg_at(args, idx) == expected
}

fn arg_at(args: &[OsString], idx: usize) -> String {
    args.get(idx)
        .map(|x| x.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn render_command(binary: &Path, args: &[OsString]) -> String {
    let mut rendered = binary.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}
