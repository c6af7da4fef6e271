use std::path::PathBuf;

use orch_git::GitError;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("failed to read workspace file {path}: {source}")]
    WorkspaceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write workspace file {path}: {source}")]
    WorkspaceWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("git evidence unavailable: {0}")]
    Git(#[from] GitError),
}
