//! Executors run a task inside its workspace
//!
//! The orchestrator only sees the [`Executor`] trait. Which implementation
//! backs it is chosen by `executor.kind` in the configuration.

pub mod claude;
pub mod mock;
pub mod progress;
pub mod running;
pub mod script;

pub use claude::ClaudeExecutor;
pub use mock::{MockExecutor, MockOutcome};
pub use progress::{ProgressCallback, ProgressEvent, ProgressHub, ProgressPhase};
pub use script::ScriptExecutor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ErrorCode;
use crate::subprocess::{ExitStatus, ProcessError, ProcessRunner};
use crate::task::{Task, TaskStatus};

#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Run `task` in `workspace`. Failures are reported in the result,
    /// never as a panic or an `Err`.
    async fn execute(&self, task: &Task, workspace: &Path, options: &ExecuteOptions)
        -> ExecutionResult;

    async fn health_check(&self) -> bool;

    /// Free execution slots
    async fn capacity(&self) -> usize;

    /// Ask a running execution to stop. Returns false when nothing was
    /// running for `task_id`.
    async fn cancel(&self, task_id: &str) -> bool;

    fn on_progress(&self, callback: ProgressCallback);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Script,
    Claude,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,

    /// Script to run, or the Claude CLI binary
    pub program: String,

    /// Arguments placed before the workspace path and iteration limit
    pub args: Vec<String>,

    /// Directory the script runs in; the workspace when unset
    pub working_dir: Option<PathBuf>,

    pub max_iterations: u32,

    pub max_concurrent: usize,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    pub env: HashMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Script,
            program: "./scripts/agent-loop.sh".to_string(),
            args: Vec::new(),
            working_dir: None,
            max_iterations: 30,
            max_concurrent: 1,
            timeout: Duration::from_secs(60 * 60),
            env: HashMap::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn options(&self) -> ExecuteOptions {
        ExecuteOptions {
            timeout: Some(self.timeout),
            max_iterations: self.max_iterations,
            dry_run: false,
            env: self.env.clone(),
            branch: None,
        }
    }
}

/// Build the executor selected by `config.kind`
pub fn build_executor(config: &ExecutorConfig, runner: Arc<dyn ProcessRunner>) -> Arc<dyn Executor> {
    match config.kind {
        ExecutorKind::Script => Arc::new(ScriptExecutor::new(runner, config.clone())),
        ExecutorKind::Claude => Arc::new(ClaudeExecutor::new(runner, config.clone())),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub timeout: Option<Duration>,
    pub max_iterations: u32,
    pub dry_run: bool,
    pub env: HashMap<String, String>,
    /// Branch checked out in the workspace, reported as an artifact
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Commit,
    File,
    Branch,
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionFailure {
    pub code: u16,
    pub message: String,
    pub recoverable: bool,
}

impl ExecutionFailure {
    pub fn new(code: u16, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        self.code == ErrorCode::EXEC_RATE_LIMITED
    }

    pub(crate) fn from_process_error(err: &ProcessError) -> Self {
        match err {
            ProcessError::CommandNotFound(program) => Self::new(
                ErrorCode::EXEC_COMMAND_NOT_FOUND,
                format!("Command not found: {program}"),
                false,
            ),
            ProcessError::Timeout(after) => Self::new(
                ErrorCode::EXEC_TIMEOUT,
                format!("Timed out after {after:?}"),
                true,
            ),
            other => Self::new(ErrorCode::EXEC_SPAWN_FAILED, other.to_string(), true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub task_id: String,
    pub success: bool,
    pub exit_code: i32,
    pub output: String,
    pub stderr: String,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub iterations: u32,
    pub final_status: TaskStatus,
    pub artifacts: Vec<Artifact>,
    pub error: Option<ExecutionFailure>,
}

impl ExecutionResult {
    pub fn succeeded(task_id: &str, output: impl Into<String>, duration: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: true,
            exit_code: 0,
            output: output.into(),
            stderr: String::new(),
            duration,
            iterations: 0,
            final_status: TaskStatus::Completed,
            artifacts: Vec::new(),
            error: None,
        }
    }

    pub fn failed(task_id: &str, failure: ExecutionFailure, duration: Duration) -> Self {
        let final_status = if failure.code == ErrorCode::EXEC_CANCELLED {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Failed
        };
        Self {
            task_id: task_id.to_string(),
            success: false,
            exit_code: 1,
            output: String::new(),
            stderr: String::new(),
            duration,
            iterations: 0,
            final_status,
            artifacts: Vec::new(),
            error: Some(failure),
        }
    }

    /// The failure looks like the agent was throttled upstream
    pub fn is_rate_limited(&self) -> bool {
        self.error.as_ref().is_some_and(ExecutionFailure::is_rate_limit)
    }
}

/// Shell-style exit code for a finished process
pub(crate) fn exit_code_of(status: &ExitStatus) -> i32 {
    match status {
        ExitStatus::Success => 0,
        ExitStatus::Error(code) => *code,
        ExitStatus::Signal(signal) => 128 + signal,
        ExitStatus::Timeout => 124,
    }
}

/// Files the agent conventionally leaves behind, plus the branch
pub(crate) async fn collect_artifacts(workspace: &Path, branch: Option<&str>) -> Vec<Artifact> {
    let mut artifacts = Vec::new();

    let candidates = [
        ("progress.txt", ArtifactKind::Log, "Agent progress log"),
        ("handoff.md", ArtifactKind::File, "Task handoff document"),
    ];
    for (name, kind, description) in candidates {
        let path = workspace.join(name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            artifacts.push(Artifact {
                kind,
                path: path.to_string_lossy().into_owned(),
                description: Some(description.to_string()),
            });
        }
    }

    if let Some(branch) = branch {
        artifacts.push(Artifact {
            kind: ArtifactKind::Branch,
            path: branch.to_string(),
            description: Some("Git branch with changes".to_string()),
        });
    }

    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_config_from_yaml() {
        let yaml = r#"
kind: claude
program: claude
maxIterations: 5
timeout: 10m
env:
  FOO: bar
"#;
        let config: ExecutorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.kind, ExecutorKind::Claude);
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert_eq!(config.max_concurrent, 1);

        let options = config.options();
        assert_eq!(options.max_iterations, 5);
        assert_eq!(options.env.get("FOO").map(String::as_str), Some("bar"));
    }

    #[test]
    fn test_failed_result_status() {
        let cancelled = ExecutionResult::failed(
            "t1",
            ExecutionFailure::new(ErrorCode::EXEC_CANCELLED, "stopped", false),
            Duration::ZERO,
        );
        assert_eq!(cancelled.final_status, TaskStatus::Cancelled);
        assert!(!cancelled.is_rate_limited());

        let limited = ExecutionResult::failed(
            "t1",
            ExecutionFailure::new(ErrorCode::EXEC_RATE_LIMITED, "429", true),
            Duration::ZERO,
        );
        assert_eq!(limited.final_status, TaskStatus::Failed);
        assert!(limited.is_rate_limited());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_of(&ExitStatus::Success), 0);
        assert_eq!(exit_code_of(&ExitStatus::Error(3)), 3);
        assert_eq!(exit_code_of(&ExitStatus::Signal(15)), 143);
    }

    #[tokio::test]
    async fn test_collect_artifacts() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("progress.txt"), "log").unwrap();

        let artifacts = collect_artifacts(dir.path(), Some("task/t1")).await;
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].kind, ArtifactKind::Log);
        assert_eq!(artifacts[1].kind, ArtifactKind::Branch);
        assert_eq!(artifacts[1].path, "task/t1");
    }
}
