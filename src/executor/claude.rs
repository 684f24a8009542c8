//! Claude CLI executor

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::progress::{ProgressCallback, ProgressEvent, ProgressHub, ProgressPhase};
use super::running::{drive, RunningTasks};
use super::{
    collect_artifacts, exit_code_of, ExecuteOptions, ExecutionFailure, ExecutionResult, Executor,
    ExecutorConfig,
};
use crate::error::ErrorCode;
use crate::ratelimit::is_rate_limit_signal;
use crate::subprocess::{ExitStatus, ProcessCommand, ProcessCommandBuilder, ProcessRunner};
use crate::task::{Task, TaskStatus};

const DEFAULT_PROGRAM: &str = "claude";

/// Runs the Claude CLI in print mode inside the workspace. The exit status
/// decides success.
pub struct ClaudeExecutor {
    runner: Arc<dyn ProcessRunner>,
    config: ExecutorConfig,
    progress: ProgressHub,
    running: RunningTasks,
}

impl ClaudeExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: ExecutorConfig) -> Self {
        Self {
            runner,
            config,
            progress: ProgressHub::new(),
            running: RunningTasks::default(),
        }
    }

    fn program(&self) -> &str {
        if self.config.program.is_empty() {
            DEFAULT_PROGRAM
        } else {
            &self.config.program
        }
    }

    fn build_command(&self, task: &Task, workspace: &Path, options: &ExecuteOptions) -> ProcessCommand {
        let mut builder = ProcessCommandBuilder::new(self.program())
            .arg("--print")
            .arg("--dangerously-skip-permissions")
            .args(&self.config.args)
            .arg(&render_prompt(task))
            .current_dir(workspace)
            .envs(&self.config.env)
            .envs(&options.env)
            .env("WORKLANE_TASK_ID", &task.id)
            // The CLI waits for stdin to close before starting
            .stdin(String::new());
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        builder.build()
    }
}

/// Prompt handed to the CLI for `task`
pub fn render_prompt(task: &Task) -> String {
    let mut prompt = format!("Task {}: {}\n", task.id, task.title);
    if !task.description.is_empty() {
        prompt.push('\n');
        prompt.push_str(&task.description);
        prompt.push('\n');
    }
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\nAcceptance criteria:\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str(&format!("- {}\n", criterion.description));
        }
    }
    if let Some(notes) = &task.notes {
        prompt.push_str(&format!("\nNotes:\n{notes}\n"));
    }
    prompt.push_str(
        "\nWork only inside the current directory and commit your changes on the current branch when done.\n",
    );
    prompt
}

#[async_trait]
impl Executor for ClaudeExecutor {
    fn name(&self) -> &str {
        "claude"
    }

    async fn execute(
        &self,
        task: &Task,
        workspace: &Path,
        options: &ExecuteOptions,
    ) -> ExecutionResult {
        let started = Instant::now();
        self.progress.emit(&ProgressEvent::new(
            &task.id,
            ProgressPhase::Initializing,
            "Starting Claude CLI",
        ));

        if options.dry_run {
            return ExecutionResult::succeeded(
                &task.id,
                format!("[DRY RUN] Would run {} in {}", self.program(), workspace.display()),
                started.elapsed(),
            );
        }

        let command = self.build_command(task, workspace, options);
        debug!("Running Claude for {} in {}", task.id, workspace.display());

        let stream = match self.runner.run_streaming(command).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to start Claude for {}: {}", task.id, e);
                return ExecutionResult::failed(
                    &task.id,
                    ExecutionFailure::from_process_error(&e),
                    started.elapsed(),
                );
            }
        };

        self.progress.emit(&ProgressEvent::new(
            &task.id,
            ProgressPhase::Running,
            "Claude is working",
        ));

        let cancel = self.running.register(&task.id, stream.pid);
        let outcome = drive(stream, cancel, |_| {}).await;
        self.running.finish(&task.id);

        let duration = started.elapsed();
        if outcome.cancelled {
            return ExecutionResult::failed(
                &task.id,
                ExecutionFailure::new(ErrorCode::EXEC_CANCELLED, "Execution cancelled", false),
                duration,
            );
        }
        let status = match (outcome.status, &outcome.error) {
            (Some(status), _) => status,
            (None, Some(e)) => {
                return ExecutionResult::failed(&task.id, ExecutionFailure::from_process_error(e), duration)
            }
            (None, None) => ExitStatus::Error(1),
        };

        let success = status.success();
        let error = (!success).then(|| {
            if status == ExitStatus::Timeout {
                ExecutionFailure::new(ErrorCode::EXEC_TIMEOUT, "Claude timed out", true)
            } else if is_rate_limit_signal(&outcome.stderr) || is_rate_limit_signal(&outcome.stdout) {
                ExecutionFailure::new(ErrorCode::EXEC_RATE_LIMITED, "Claude was rate limited", true)
            } else {
                let detail = if outcome.stderr.trim().is_empty() {
                    format!("exit code {}", exit_code_of(&status))
                } else {
                    outcome.stderr.trim().to_string()
                };
                ExecutionFailure::new(
                    ErrorCode::EXEC_SUBPROCESS_FAILED,
                    format!("Claude failed: {detail}"),
                    true,
                )
            }
        });

        if success {
            self.progress.emit(
                &ProgressEvent::new(&task.id, ProgressPhase::Finalizing, "Claude finished")
                    .with_percentage(100.0),
            );
        }
        info!("Claude for {} finished: success={} in {:?}", task.id, success, duration);

        ExecutionResult {
            task_id: task.id.clone(),
            success,
            exit_code: exit_code_of(&status),
            output: outcome.stdout,
            stderr: outcome.stderr,
            duration,
            iterations: 1,
            final_status: if success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            },
            artifacts: collect_artifacts(workspace, options.branch.as_deref()).await,
            error,
        }
    }

    async fn health_check(&self) -> bool {
        let command = ProcessCommandBuilder::new(self.program())
            .arg("--version")
            .timeout(std::time::Duration::from_secs(10))
            .build();
        match self.runner.run(command).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!("Claude CLI health check failed: {}", e);
                false
            }
        }
    }

    async fn capacity(&self) -> usize {
        self.config.max_concurrent.saturating_sub(self.running.len())
    }

    async fn cancel(&self, task_id: &str) -> bool {
        self.running.cancel(task_id)
    }

    fn on_progress(&self, callback: ProgressCallback) {
        self.progress.subscribe(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorKind;
    use crate::subprocess::MockProcessRunner;

    fn executor(mock: &MockProcessRunner) -> ClaudeExecutor {
        ClaudeExecutor::new(
            Arc::new(mock.clone()),
            ExecutorConfig {
                kind: ExecutorKind::Claude,
                program: String::new(),
                ..ExecutorConfig::default()
            },
        )
    }

    #[test]
    fn test_prompt_lists_criteria() {
        let task = Task::new("US-7", "Export CSV").with_criteria(["has header row", "escapes commas"]);
        let prompt = render_prompt(&task);
        assert!(prompt.starts_with("Task US-7: Export CSV\n"));
        assert!(prompt.contains("- has header row\n- escapes commas\n"));
    }

    #[tokio::test]
    async fn test_exit_status_decides_success() {
        let workspace = tempfile::TempDir::new().unwrap();
        let mut mock = MockProcessRunner::new();
        mock.expect_command("claude")
            .with_args(|args| args.first().map(String::as_str) == Some("--print"))
            .returns_stdout("done\n")
            .finish();

        let options = ExecuteOptions {
            branch: Some("task/US-7".to_string()),
            ..ExecuteOptions::default()
        };
        let result = executor(&mock)
            .execute(&Task::new("US-7", "Export CSV"), workspace.path(), &options)
            .await;

        assert!(result.success);
        assert_eq!(result.artifacts.len(), 1);
        let call = &mock.get_call_history()[0];
        assert_eq!(call.working_dir.as_deref(), Some(workspace.path()));
        assert_eq!(call.stdin.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_rate_limited_failure() {
        let workspace = tempfile::TempDir::new().unwrap();
        let mut mock = MockProcessRunner::new();
        mock.expect_command("claude")
            .returns_exit_code(1)
            .returns_stderr("API Error: 429 rate_limit_error")
            .finish();

        let result = executor(&mock)
            .execute(&Task::new("US-7", "x"), workspace.path(), &ExecuteOptions::default())
            .await;

        assert!(!result.success);
        assert!(result.is_rate_limited());
    }

    #[tokio::test]
    async fn test_health_check_runs_version() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("claude")
            .with_args(|args| args == ["--version"])
            .returns_stdout("1.0.0 (Claude Code)\n")
            .finish();
        assert!(executor(&mock).health_check().await);

        let missing = MockProcessRunner::new();
        assert!(!executor(&missing).health_check().await);
    }
}
