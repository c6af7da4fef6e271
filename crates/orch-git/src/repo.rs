use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::command::GitCli;
use crate::error::GitError;

const LOG_FORMAT: &str = "--format=%H%x09%s";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoHandle {
    pub root: PathBuf,
    pub git_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub sha: String,
    pub subject: String,
}

pub fn discover_repo(start_path: &Path, git: &GitCli) -> Result<RepoHandle, GitError> {
    let inside = match git.run(start_path, ["rev-parse", "--is-inside-work-tree"]) {
        Ok(output) => output.stdout.trim().eq("true"),
        Err(GitError::CommandFailed { .. }) => false,
        Err(err) => return Err(err),
    };

    if !inside {
        return Err(GitError::NotARepository {
            path: start_path.to_path_buf(),
        });
    }

    let root_raw = git.run(start_path, ["rev-parse", "--show-toplevel"])?;
    let root = PathBuf::from(root_raw.stdout.trim());

    let git_dir_raw = git.run(&root, ["rev-parse", "--git-dir"])?;
    let git_dir_rel = PathBuf::from(git_dir_raw.stdout.trim());
    let git_dir = if git_dir_rel.is_absolute() {
        git_dir_rel
    } else {
        root.join(git_dir_rel)
    };

    Ok(RepoHandle { root, git_dir })
}

/// HEAD of the repository, or `None` before the first commit.
pub fn head_sha(repo: &RepoHandle, git: &GitCli) -> Result<Option<String>, GitError> {
    match git.run(&repo.root, ["rev-parse", "--verify", "--quiet", "HEAD"]) {
        Ok(output) => Ok(Some(output.stdout.trim().to_string())),
        Err(GitError::CommandFailed { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

pub fn commit_exists(repo: &RepoHandle, git: &GitCli, revision: &str) -> Result<bool, GitError> {
    let spec = format!("{revision}^{{commit}}");
    match git.run(&repo.root, ["rev-parse", "--verify", "--quiet", spec.as_str()]) {
        Ok(_) => Ok(true),
        Err(GitError::CommandFailed { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Commits reachable from HEAD but not from `base`, newest first.
pub fn commits_since(
    repo: &RepoHandle,
    git: &GitCli,
    base: &str,
) -> Result<Vec<CommitSummary>, GitError> {
    if !commit_exists(repo, git, base)? {
        return Err(GitError::UnknownRevision {
            revision: base.to_string(),
            path: repo.root.clone(),
        });
    }
    if head_sha(repo, git)?.is_none() {
        return Ok(Vec::new());
    }
    let range = format!("{base}..HEAD");
    let output = git.run(&repo.root, ["log", LOG_FORMAT, range.as_str()])?;
    parse_log(&output.stdout)
}

/// Commits on HEAD whose committer date is at or after `since`.
pub fn commits_since_time(
    repo: &RepoHandle,
    git: &GitCli,
    since: DateTime<Utc>,
) -> Result<Vec<CommitSummary>, GitError> {
    if head_sha(repo, git)?.is_none() {
        return Ok(Vec::new());
    }
    let since_arg = format!(
        "--since={}",
        since.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    let output = git.run(&repo.root, ["log", LOG_FORMAT, since_arg.as_str(), "HEAD"])?;
    parse_log(&output.stdout)
}

fn parse_log(raw: &str) -> Result<Vec<CommitSummary>, GitError> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (sha, subject) = line.split_once('\t').unwrap_or((line, ""));
            if sha.len() < 7 || !sha.chars().all(|ch| ch.is_ascii_hexdigit()) {
                return Err(GitError::Parse {
                    context: format!("invalid log line: {line}"),
                });
            }
            Ok(CommitSummary {
                sha: sha.to_string(),
                subject: subject.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use std::time::{SystemTime, UNIX_EPOCH};

    use chrono::{Duration, Utc};

    use super::{commit_exists, commits_since, commits_since_time, discover_repo, head_sha, parse_log};
    use crate::command::GitCli;
    use crate::error::GitError;

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("orch-git-{prefix}-{now}"))
    }

    fn run_git(cwd: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn commit_file(root: &Path, name: &str, message: &str) {
        fs::write(root.join(name), format!("{message}\n")).expect("write file");
        run_git(root, &["add", name]);
        run_git(
            root,
            &[
                "-c",
                "user.name=Test User",
                "-c",
                "user.email=test@example.com",
                "commit",
                "-m",
                message,
            ],
        );
    }

    fn init_repo(prefix: &str) -> PathBuf {
        let root = unique_temp_dir(prefix);
        fs::create_dir_all(&root).expect("create temp repo");
        run_git(&root, &["init"]);
        root
    }

    #[test]
    fn discover_repo_finds_root_from_nested_path() {
        let root = init_repo("discover");
        let nested = root.join("src").join("bin");
        fs::create_dir_all(&nested).expect("create nested dir");

        let git = GitCli::default();
        let repo = discover_repo(&nested, &git).expect("discover repo");
        assert_eq!(repo.root, root);
        assert_eq!(repo.git_dir, repo.root.join(".git"));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn discover_repo_rejects_plain_directory() {
        let dir = unique_temp_dir("plain");
        fs::create_dir_all(&dir).expect("create plain dir");

        let err = discover_repo(&dir, &GitCli::default()).expect_err("not a repository");
        assert!(matches!(err, GitError::NotARepository { path } if path == dir));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_repository_has_no_head_and_no_commits() {
        let root = init_repo("empty");
        let git = GitCli::default();
        let repo = discover_repo(&root, &git).expect("discover repo");

        assert_eq!(head_sha(&repo, &git).expect("head"), None);
        let commits =
            commits_since_time(&repo, &git, Utc::now() - Duration::hours(1)).expect("log");
        assert!(commits.is_empty());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn commits_since_base_lists_only_new_work() {
        let root = init_repo("since-base");
        commit_file(&root, "README.md", "init");
        let git = GitCli::default();
        let repo = discover_repo(&root, &git).expect("discover repo");
        let base = head_sha(&repo, &git).expect("head").expect("has head");
        assert!(commit_exists(&repo, &git, &base).expect("exists"));

        assert!(commits_since(&repo, &git, &base).expect("log").is_empty());

        commit_file(&root, "fix.rs", "fix login bug");
        let commits = commits_since(&repo, &git, &base).expect("log");
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].subject, "fix login bug");

        let all = commits_since_time(&repo, &git, Utc::now() - Duration::hours(1)).expect("log");
        assert_eq!(all.len(), 2);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn commits_since_unknown_base_is_an_error() {
        let root = init_repo("unknown-base");
        commit_file(&root, "README.md", "init");
        let git = GitCli::default();
        let repo = discover_repo(&root, &git).expect("discover repo");

        let err = commits_since(&repo, &git, "0123456789abcdef0123456789abcdef01234567")
            .expect_err("missing base");
        assert!(matches!(err, GitError::UnknownRevision { .. }));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn parse_log_rejects_non_hash_lines() {
        let parsed = parse_log("abcdef1\tsubject with\ttab\n").expect("parse");
        assert_eq!(parsed[0].subject, "subject with\ttab");
        assert!(parse_log("not-a-sha\tsubject\n").is_err());
    }
}
