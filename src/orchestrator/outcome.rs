use serde::Serialize;
use std::time::Duration;

use crate::error::WorklaneError;
use crate::executor::ExecutionResult;
use crate::workspace::{ReclaimResult, WorkspaceInfo};

/// Where a task's lifecycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    /// No rate-limit slot within the allowed wait, or stopped while waiting
    Admission,
    /// The workspace could not be created, or the task was stopped before
    /// the executor started
    Workspace,
    /// The executor exceeded the task timeout
    Execution,
    Complete,
    /// The executor ran and reported failure
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskError {
    pub code: u16,
    pub message: String,
}

impl From<&WorklaneError> for TaskError {
    fn from(err: &WorklaneError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub task_id: String,
    pub success: bool,
    pub phase: TaskPhase,
    pub execution: Option<ExecutionResult>,
    pub error: Option<TaskError>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub workspace: Option<WorkspaceInfo>,
    pub reclaim: Option<ReclaimResult>,
}

impl TaskOutcome {
    pub(crate) fn rejected(task_id: &str, phase: TaskPhase, error: TaskError, duration: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            phase,
            execution: None,
            error: Some(error),
            duration,
            workspace: None,
            reclaim: None,
        }
    }
}
