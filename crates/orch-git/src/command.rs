use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::GitError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCli {
    pub binary: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run git in `cwd`, failing on a non-zero exit.
    pub fn run<I, S>(&self, cwd: &Path, args: I) -> Result<GitOutput, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.execute(cwd, collect_args(args))
    }

    /// Like [`GitCli::run`], limited to `pathspecs` after a `--` separator.
    pub fn run_limited<I, S, P>(
        &self,
        cwd: &Path,
        args: I,
        pathspecs: &[P],
    ) -> Result<GitOutput, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
        P: AsRef<OsStr>,
    {
        let mut owned = collect_args(args);
        if !pathspecs.is_empty() {
            owned.push(OsString::from("--"));
            owned.extend(pathspecs.iter().map(|spec| spec.as_ref().to_os_string()));
        }
        self.execute(cwd, owned)
    }

    fn execute(&self, cwd: &Path, args: Vec<OsString>) -> Result<GitOutput, GitError> {
        let rendered = render_command(&self.binary, &args);
        debug!(command = %rendered, cwd = %cwd.display(), "running git");
        let output = Command::new(&self.binary)
            .current_dir(cwd)
            // Read-only queries must not contend with a running agent for index.lock.
            .env("GIT_OPTIONAL_LOCKS", "0")
            .env("LC_ALL", "C")
            .args(&args)
            .output()
            .map_err(|source| GitError::Io {
                command: rendered.clone(),
                source,
            })?;

        let decode = |bytes: Vec<u8>, stream: &'static str| {
            String::from_utf8(bytes).map_err(|source| GitError::NonUtf8Output {
                command: rendered.clone(),
                stream,
                source,
            })
        };
        let stdout = decode(output.stdout, "stdout")?;
        let stderr = decode(output.stderr, "stderr")?;

        if output.status.success() {
            Ok(GitOutput { stdout, stderr })
        } else {
            Err(GitError::CommandFailed {
                command: rendered,
                status: output.status.code(),
                stdout,
                stderr,
            })
        }
    }
}

fn collect_args<I, S>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    args.into_iter()
        .map(|arg| arg.as_ref().to_os_string())
        .collect()
}

fn render_command(binary: &Path, args: &[OsString]) -> String {
    let mut rendered = binary.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::{render_command, GitCli};
    use crate::error::GitError;
    use std::ffi::OsString;
    use std::path::Path;

    #[test]
    fn run_reports_version_from_scratch_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = GitCli::default()
            .run(dir.path(), ["--version"])
            .expect("git --version should succeed");
        assert!(output.stdout.starts_with("git version"));
    }

    #[test]
    fn non_zero_exit_keeps_stderr_for_diagnosis() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = GitCli::default()
            .run(dir.path(), ["rev-parse", "HEAD"])
            .expect_err("rev-parse outside a repository should fail");
        match err {
            GitError::CommandFailed {
                command,
                status,
                stderr,
                ..
            } => {
                assert_eq!(command, "git rev-parse HEAD");
                assert_eq!(status, Some(128));
                assert!(stderr.contains("not a git repository"));
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn missing_binary_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = GitCli::new("/definitely/missing/git-binary")
            .run(dir.path(), ["status"])
            .expect_err("missing binary should fail");
        assert!(
            matches!(err, GitError::Io { ref source, .. } if source.kind() == std::io::ErrorKind::NotFound)
        );
    }

    #[test]
    fn limited_run_puts_pathspecs_after_separator() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = GitCli::default()
            .run_limited(dir.path(), ["status", "--porcelain=v1"], &["."])
            .expect_err("status outside a repository should fail");
        match err {
            GitError::CommandFailed { command, .. } => {
                assert_eq!(command, "git status --porcelain=v1 -- .");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn rendered_command_joins_binary_and_args() {
        let args = vec![OsString::from("log"), OsString::from("--format=%H")];
        assert_eq!(render_command(Path::new("git"), &args), "git log --format=%H");
    }
}
