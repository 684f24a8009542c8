//! Isolated per-task workspaces backed by git worktrees
//!
//! Each task gets its own directory under the configured base path, checked
//! out on its own branch. [`WorkspaceManager`] owns the lifecycle and keeps an
//! in-memory index that `list()` reconciles with git's worktree registry;
//! [`WorkspaceReclaimer`] performs deletion that survives locked files and
//! preserves uncommitted work.

pub mod config;
pub mod error;
pub mod fs;
pub mod manager;
pub mod paths;
pub mod reclaim;

pub use config::{GitSettings, ReclaimConfig, WorktreeConfig, TASK_ID_PLACEHOLDER};
pub use error::WorkspaceError;
pub use fs::{TokioFs, WorkspaceFs};
pub use manager::WorkspaceManager;
pub use reclaim::{ReclaimOptions, ReclaimResult, WorkspaceReclaimer};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    pub path: PathBuf,
    pub branch: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    /// A task of this process is still running in the workspace
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    pub has_changes: bool,
    pub ahead: u32,
    pub behind: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveOutcome {
    pub branch: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub branch: String,
    pub target: String,
    pub removed: Option<RemoveOutcome>,
}
