//! The per-agent workspace file the agent reports its phase in.

use orch_core::phase::latest_phase;
use orch_core::types::AgentId;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::VerifyError;

pub const WORKSPACE_FILE: &str = "WORKSPACE.md";

/// The file behind a workspace reference, which may name the file or its directory.
pub fn workspace_file(workspace_ref: &Path) -> PathBuf {
    if workspace_ref.is_dir() {
        workspace_ref.join(WORKSPACE_FILE)
    } else {
        workspace_ref.to_path_buf()
    }
}

/// Current phase, or `Ok(None)` when the file exists but reports none.
///
/// A missing file is `Err` with `ErrorKind::NotFound` as the source.
pub fn read_workspace_phase(workspace_ref: &Path) -> Result<Option<String>, VerifyError> {
    let path = workspace_file(workspace_ref);
    let text = fs::read_to_string(&path)
        .map_err(|source| VerifyError::WorkspaceRead { path, source })?;
    Ok(latest_phase(&text))
}

pub fn is_missing(err: &VerifyError) -> bool {
    matches!(err, VerifyError::WorkspaceRead { source, .. } if source.kind() == ErrorKind::NotFound)
}

/// Create `<dir>/WORKSPACE.md` with the initial phase for a fresh agent.
pub fn create_workspace(dir: &Path, id: &AgentId, task: &str) -> Result<PathBuf, VerifyError> {
    fs::create_dir_all(dir).map_err(|source| VerifyError::WorkspaceWrite {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(WORKSPACE_FILE);
    let body = format!(
        "# Workspace: {id}\n\n## Task\n\n{task}\n\n## Status\n\nPhase: Planning\n"
    );
    fs::write(&path, body).map_err(|source| VerifyError::WorkspaceWrite {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}
