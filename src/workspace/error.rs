use std::path::PathBuf;
use thiserror::Error;

use crate::error::{ErrorCode, WorklaneError};
use crate::git::GitError;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("No workspace for task {0}")]
    UnknownWorkspace(String),

    #[error("Invalid task id {task_id:?}: {reason}")]
    InvalidTaskId { task_id: String, reason: String },

    #[error("Path {path} is not inside {base}")]
    InvalidPath { path: PathBuf, base: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Reclamation failed: {}", warnings.join("; "))]
    ReclaimFailed { warnings: Vec<String> },

    #[error(transparent)]
    Git(#[from] GitError),
}

impl From<WorkspaceError> for WorklaneError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::Git(git) => git.into(),
            WorkspaceError::UnknownWorkspace(_) => WorklaneError::workspace_with_code(
                ErrorCode::WORKSPACE_NOT_FOUND,
                err.to_string(),
                None,
            ),
            WorkspaceError::InvalidTaskId { .. } => WorklaneError::validation_with_code(
                ErrorCode::WORKSPACE_INVALID_TASK_ID,
                err.to_string(),
                Some("taskId".to_string()),
            ),
            WorkspaceError::InvalidPath { ref path, .. } => {
                let path = path.clone();
                WorklaneError::workspace_with_code(
                    ErrorCode::WORKSPACE_INVALID_PATH,
                    err.to_string(),
                    Some(path),
                )
            }
            WorkspaceError::Io { path, source } => WorklaneError::workspace_with_code(
                ErrorCode::WORKSPACE_IO_ERROR,
                "I/O operation failed",
                Some(path),
            )
            .with_source(source),
            WorkspaceError::ReclaimFailed { .. } => WorklaneError::workspace_with_code(
                ErrorCode::WORKSPACE_RECLAIM_FAILED,
                err.to_string(),
                None,
            ),
        }
    }
}
