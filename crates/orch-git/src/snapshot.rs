use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::command::GitCli;
use crate::error::GitError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Added,
    Modified,
    Deleted,
    Renamed,
    Copied,
    Unmerged,
    Untracked,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    /// `/`-separated path, relative to the repository root as git reports
    /// it, or to the project once scoped by [`uncommitted_changes`].
    pub path: String,
    /// Source path of a rename or copy.
    pub original_path: Option<String>,
    pub state: FileState,
    pub status_code: String,
}

/// Every staged, unstaged or untracked change under `project`.
///
/// Paths come back relative to `project`, which may be a subdirectory of
/// the repository. A rename source outside the project is dropped.
pub fn uncommitted_changes(git: &GitCli, project: &Path) -> Result<Vec<ChangedFile>, GitError> {
    let prefix = git.run(project, ["rev-parse", "--show-prefix"])?;
    let prefix = prefix.stdout.trim();
    let output = git.run_limited(
        project,
        ["status", "--porcelain=v1", "-z", "--untracked-files=all"],
        &["."],
    )?;
    Ok(parse_porcelain_status(&output.stdout)?
        .into_iter()
        .filter_map(|change| relative_to_prefix(change, prefix))
        .collect())
}

fn relative_to_prefix(change: ChangedFile, prefix: &str) -> Option<ChangedFile> {
    let path = change.path.strip_prefix(prefix)?.to_string();
    let original_path = change
        .original_path
        .as_deref()
        .and_then(|original| original.strip_prefix(prefix))
        .map(str::to_string);
    Some(ChangedFile {
        path,
        original_path,
        ..change
    })
}

/// Parse NUL-separated `status --porcelain=v1 -z` output.
///
/// Renames and copies carry their source path as the following entry.
pub fn parse_porcelain_status(raw: &str) -> Result<Vec<ChangedFile>, GitError> {
    let mut files = Vec::new();
    let mut entries = raw.split('\0').filter(|entry| !entry.is_empty());

    while let Some(entry) = entries.next() {
        if entry.len() < 4 || !entry.is_char_boundary(2) || entry.as_bytes()[2] != b' ' {
            return Err(GitError::Parse {
                context: format!("invalid porcelain status entry: {entry:?}"),
            });
        }

        let code = &entry[0..2];
        let state = file_state_from_code(code);
        let original_path = if matches!(state, FileState::Renamed | FileState::Copied) {
            let source = entries.next().ok_or_else(|| GitError::Parse {
                context: format!("rename entry without source path: {entry:?}"),
            })?;
            Some(source.to_string())
        } else {
            None
        };

        files.push(ChangedFile {
            path: entry[3..].to_string(),
            original_path,
            state,
            status_code: code.to_string(),
        });
    }

    Ok(files)
}

fn file_state_from_code(code: &str) -> FileState {
    if code == "??" {
        return FileState::Untracked;
    }
    if code.contains('U') || code == "AA" || code == "DD" {
        return FileState::Unmerged;
    }
    if code.contains('R') {
        return FileState::Renamed;
    }
    if code.contains('C') {
        return FileState::Copied;
    }
    if code.contains('A') {
        return FileState::Added;
    }
    if code.contains('D') {
        return FileState::Deleted;
    }
    if code.contains('M') || code.contains('T') {
        return FileState::Modified;
    }
    FileState::Unknown
}
