//! Executor that drives an iterative agent loop script
//!
//! The script is invoked as `<program> <args…> <workspace> <max_iterations>`
//! with `task.json` already written into the workspace. It reports progress
//! by printing `Iteration N` lines and signals completion with
//! `<promise>COMPLETE</promise>` or `All stories passed!`.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::progress::{ProgressCallback, ProgressEvent, ProgressHub, ProgressPhase};
use super::running::{drive, RunningTasks, StreamOutcome};
use super::{
    collect_artifacts, exit_code_of, ExecuteOptions, ExecutionFailure, ExecutionResult, Executor,
    ExecutorConfig,
};
use crate::error::ErrorCode;
use crate::ratelimit::is_rate_limit_signal;
use crate::subprocess::{ExitStatus, ProcessCommand, ProcessCommandBuilder, ProcessRunner};
use crate::task::{Task, TaskStatus};

pub const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";
pub const ALL_PASSED_MARKER: &str = "All stories passed!";
const MAX_ITERATIONS_MARKER: &str = "Max iterations reached";
pub const TASK_FILE: &str = "task.json";
const PROGRESS_FILE: &str = "progress.txt";

static ITERATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)iteration (\d+)").unwrap_or_else(|e| panic!("invalid iteration pattern: {e}"))
});

/// Iteration number announced on `line`, if any
pub fn parse_iteration(line: &str) -> Option<u32> {
    ITERATION_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Highest iteration number announced anywhere in `output`
pub fn count_iterations(output: &str) -> u32 {
    ITERATION_RE
        .captures_iter(output)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .max()
        .unwrap_or(0)
}

pub fn completion_detected(output: &str) -> bool {
    output.contains(COMPLETION_MARKER) || output.contains(ALL_PASSED_MARKER)
}

pub struct ScriptExecutor {
    runner: Arc<dyn ProcessRunner>,
    config: ExecutorConfig,
    progress: ProgressHub,
    running: RunningTasks,
}

impl ScriptExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: ExecutorConfig) -> Self {
        Self {
            runner,
            config,
            progress: ProgressHub::new(),
            running: RunningTasks::default(),
        }
    }

    async fn prepare_workspace(&self, task: &Task, workspace: &Path, branch: Option<&str>) -> std::io::Result<()> {
        let task_json = serde_json::to_string_pretty(task)?;
        tokio::fs::write(workspace.join(TASK_FILE), task_json).await?;

        let progress_path = workspace.join(PROGRESS_FILE);
        if !tokio::fs::try_exists(&progress_path).await.unwrap_or(false) {
            tokio::fs::write(&progress_path, initial_progress(task, branch)).await?;
        }
        Ok(())
    }

    fn build_command(
        &self,
        task: &Task,
        workspace: &Path,
        max_iterations: u32,
        options: &ExecuteOptions,
    ) -> ProcessCommand {
        let working_dir: PathBuf = self
            .config
            .working_dir
            .clone()
            .unwrap_or_else(|| workspace.to_path_buf());

        let mut builder = ProcessCommandBuilder::new(&self.config.program)
            .args(&self.config.args)
            .arg(&workspace.to_string_lossy())
            .arg(&max_iterations.to_string())
            .current_dir(&working_dir)
            .envs(&self.config.env)
            .envs(&options.env)
            .env("WORKLANE_TASK_ID", &task.id);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        builder.build()
    }

    fn observe_line(&self, task_id: &str, line: &str, max_iterations: u32) {
        if let Some(iteration) = parse_iteration(line) {
            self.progress
                .emit(&ProgressEvent::iteration(task_id, iteration, max_iterations));
        }
        if line.contains(COMPLETION_MARKER) {
            self.progress.emit(
                &ProgressEvent::new(task_id, ProgressPhase::Finalizing, "Task completed successfully")
                    .with_percentage(100.0),
            );
        }
    }

    fn interpret(&self, task: &Task, outcome: StreamOutcome, started: Instant) -> ExecutionResult {
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
                return ExecutionResult {
                    output: outcome.stdout,
                    stderr: outcome.stderr,
                    ..ExecutionResult::failed(&task.id, ExecutionFailure::from_process_error(e), duration)
                }
            }
            (None, None) => ExitStatus::Error(1),
        };

        let success = completion_detected(&outcome.stdout);
        let error = if success {
            None
        } else {
            Some(classify_failure(&status, &outcome.stdout, &outcome.stderr))
        };

        ExecutionResult {
            task_id: task.id.clone(),
            success,
            exit_code: exit_code_of(&status),
            iterations: count_iterations(&outcome.stdout),
            output: outcome.stdout,
            stderr: outcome.stderr,
            duration,
            final_status: if success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            },
            artifacts: Vec::new(),
            error,
        }
    }
}

fn classify_failure(status: &ExitStatus, stdout: &str, stderr: &str) -> ExecutionFailure {
    if *status == ExitStatus::Timeout {
        return ExecutionFailure::new(ErrorCode::EXEC_TIMEOUT, "Script timed out", true);
    }
    if is_rate_limit_signal(stderr) || is_rate_limit_signal(stdout) {
        return ExecutionFailure::new(ErrorCode::EXEC_RATE_LIMITED, "Agent was rate limited", true);
    }
    if stdout.contains(MAX_ITERATIONS_MARKER) {
        return ExecutionFailure::new(
            ErrorCode::EXEC_INCOMPLETE,
            "Max iterations reached without completion",
            true,
        );
    }
    let detail = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no completion marker in output");
    ExecutionFailure::new(
        ErrorCode::EXEC_SUBPROCESS_FAILED,
        format!("Script exited with {}: {}", exit_code_of(status), detail.trim()),
        true,
    )
}

fn initial_progress(task: &Task, branch: Option<&str>) -> String {
    let mut lines = vec![
        format!("# Progress: {}", task.title),
        format!("Started: {}", chrono::Utc::now().format("%Y-%m-%d")),
        format!("Task ID: {}", task.id),
    ];
    if let Some(branch) = branch {
        lines.push(format!("Branch: {branch}"));
    }
    lines.push(String::new());
    lines.push("## Acceptance Criteria".to_string());
    lines.push(String::new());
    for criterion in &task.acceptance_criteria {
        let mark = if criterion.passed { "x" } else { " " };
        lines.push(format!("- [{mark}] {}", criterion.description));
    }
    lines.push(String::new());
    lines.push("## Session Log".to_string());
    lines.push(String::new());
    lines.push(format!("[{}] Execution started", chrono::Utc::now().to_rfc3339()));
    lines.push(String::new());
    lines.join("\n")
}

#[async_trait]
impl Executor for ScriptExecutor {
    fn name(&self) -> &str {
        "script"
    }

    async fn execute(
        &self,
        task: &Task,
        workspace: &Path,
        options: &ExecuteOptions,
    ) -> ExecutionResult {
        let started = Instant::now();
        let max_iterations = if options.max_iterations > 0 {
            options.max_iterations
        } else {
            self.config.max_iterations
        };

        if let Err(e) = self
            .prepare_workspace(task, workspace, options.branch.as_deref())
            .await
        {
            warn!("Cannot prepare workspace {}: {}", workspace.display(), e);
            return ExecutionResult::failed(
                &task.id,
                ExecutionFailure::new(
                    ErrorCode::EXEC_ENVIRONMENT_ERROR,
                    format!("Cannot prepare workspace: {e}"),
                    true,
                ),
                started.elapsed(),
            );
        }

        self.progress.emit(&ProgressEvent::new(
            &task.id,
            ProgressPhase::Initializing,
            "Starting script execution",
        ));

        if options.dry_run {
            info!("[DRY RUN] Would run {} for task {}", self.config.program, task.id);
            return ExecutionResult {
                artifacts: collect_artifacts(workspace, options.branch.as_deref()).await,
                ..ExecutionResult::succeeded(
                    &task.id,
                    format!(
                        "[DRY RUN] Would run {} in {} with at most {} iterations",
                        self.config.program,
                        workspace.display(),
                        max_iterations
                    ),
                    started.elapsed(),
                )
            };
        }

        let command = self.build_command(task, workspace, max_iterations, options);
        debug!("Running agent script for {}: {}", task.id, command.display());

        let stream = match self.runner.run_streaming(command).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to start agent script for {}: {}", task.id, e);
                return ExecutionResult::failed(
                    &task.id,
                    ExecutionFailure::from_process_error(&e),
                    started.elapsed(),
                );
            }
        };

        let cancel = self.running.register(&task.id, stream.pid);
        let outcome = drive(stream, cancel, |line| {
            self.observe_line(&task.id, line, max_iterations)
        })
        .await;
        self.running.finish(&task.id);

        let mut result = self.interpret(task, outcome, started);
        result.artifacts = collect_artifacts(workspace, options.branch.as_deref()).await;

        info!(
            "Script for {} finished: success={} iterations={} in {:?}",
            task.id, result.success, result.iterations, result.duration
        );
        result
    }

    async fn health_check(&self) -> bool {
        let program = Path::new(&self.config.program);
        if program.components().count() > 1 {
            let resolved = match &self.config.working_dir {
                Some(dir) if program.is_relative() => dir.join(program),
                _ => program.to_path_buf(),
            };
            return resolved.is_file();
        }

        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
            .unwrap_or(false)
    }

    async fn capacity(&self) -> usize {
        self.config.max_concurrent.saturating_sub(self.running.len())
    }

    async fn cancel(&self, task_id: &str) -> bool {
        let cancelled = self.running.cancel(task_id);
        if cancelled {
            info!("Cancelled script execution for {}", task_id);
        }
        cancelled
    }

    fn on_progress(&self, callback: ProgressCallback) {
        self.progress.subscribe(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ArtifactKind;
    use crate::subprocess::MockProcessRunner;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn executor(mock: &MockProcessRunner) -> ScriptExecutor {
        ScriptExecutor::new(
            Arc::new(mock.clone()),
            ExecutorConfig {
                program: "./loop.sh".to_string(),
                args: vec!["--quiet".to_string()],
                ..ExecutorConfig::default()
            },
        )
    }

    fn options() -> ExecuteOptions {
        ExecuteOptions {
            max_iterations: 10,
            branch: Some("task/US-001".to_string()),
            ..ExecuteOptions::default()
        }
    }

    #[test]
    fn test_iteration_parsing() {
        assert_eq!(parse_iteration("=== Iteration 4 of 10 ==="), Some(4));
        assert_eq!(parse_iteration("ITERATION 12"), Some(12));
        assert_eq!(parse_iteration("no progress here"), None);
        assert_eq!(count_iterations("Iteration 1\nIteration 3\nIteration 2\n"), 3);
        assert_eq!(count_iterations(""), 0);
    }

    #[tokio::test]
    async fn test_successful_run_reports_progress_and_artifacts() {
        let workspace = TempDir::new().unwrap();
        let mut mock = MockProcessRunner::new();
        mock.expect_command("./loop.sh")
            .returns_stdout("Iteration 1\nIteration 2\n<promise>COMPLETE</promise>\n")
            .finish();
        let executor = executor(&mock);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        executor.on_progress(Arc::new(move |event: &ProgressEvent| {
            sink.lock().unwrap().push(event.phase);
        }));

        let task = Task::new("US-001", "Login").with_criteria(["form validates"]);
        let result = executor.execute(&task, workspace.path(), &options()).await;

        assert!(result.success);
        assert_eq!(result.iterations, 2);
        assert_eq!(result.final_status, TaskStatus::Completed);
        assert!(result.error.is_none());
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ProgressPhase::Initializing,
                ProgressPhase::Running,
                ProgressPhase::Running,
                ProgressPhase::Finalizing
            ]
        );

        let written: Task =
            serde_json::from_str(&std::fs::read_to_string(workspace.path().join(TASK_FILE)).unwrap())
                .unwrap();
        assert_eq!(written, task);
        let progress = std::fs::read_to_string(workspace.path().join("progress.txt")).unwrap();
        assert!(progress.contains("- [ ] form validates"));

        let kinds: Vec<_> = result.artifacts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ArtifactKind::Log, ArtifactKind::Branch]);

        let call = &mock.get_call_history()[0];
        assert_eq!(
            call.args,
            vec![
                "--quiet".to_string(),
                workspace.path().to_string_lossy().into_owned(),
                "10".to_string()
            ]
        );
        assert_eq!(call.env.get("WORKLANE_TASK_ID").map(String::as_str), Some("US-001"));
        assert_eq!(call.working_dir.as_deref(), Some(workspace.path()));
    }

    #[tokio::test]
    async fn test_missing_marker_is_a_failure() {
        let workspace = TempDir::new().unwrap();
        let mut mock = MockProcessRunner::new();
        mock.expect_command("./loop.sh")
            .returns_stdout("Iteration 1\nMax iterations reached\n")
            .finish();

        let result = executor(&mock)
            .execute(&Task::new("t1", "x"), workspace.path(), &options())
            .await;

        assert!(!result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.error.unwrap().code, ErrorCode::EXEC_INCOMPLETE);
    }

    #[tokio::test]
    async fn test_rate_limit_output_is_classified() {
        let workspace = TempDir::new().unwrap();
        let mut mock = MockProcessRunner::new();
        mock.expect_command("./loop.sh")
            .returns_stderr("Error: 429 Too Many Requests\n")
            .returns_exit_code(1)
            .finish();

        let result = executor(&mock)
            .execute(&Task::new("t1", "x"), workspace.path(), &options())
            .await;

        assert!(result.is_rate_limited());
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_spawn() {
        let workspace = TempDir::new().unwrap();
        let mock = MockProcessRunner::new();
        let dry = ExecuteOptions {
            dry_run: true,
            ..options()
        };

        let result = executor(&mock)
            .execute(&Task::new("t1", "x"), workspace.path(), &dry)
            .await;

        assert!(result.success);
        assert!(result.output.starts_with("[DRY RUN]"));
        assert!(mock.get_call_history().is_empty());
        assert!(workspace.path().join(TASK_FILE).exists());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let workspace = TempDir::new().unwrap();
        let mut mock = MockProcessRunner::new();
        mock.expect_command("./loop.sh").returns_not_found().finish();

        let result = executor(&mock)
            .execute(&Task::new("t1", "x"), workspace.path(), &options())
            .await;

        let failure = result.error.unwrap();
        assert_eq!(failure.code, ErrorCode::EXEC_COMMAND_NOT_FOUND);
        assert!(!failure.recoverable);
    }

    #[tokio::test]
    async fn test_capacity_and_health() {
        let mock = MockProcessRunner::new();
        let executor = executor(&mock);
        assert_eq!(executor.capacity().await, 1);
        assert!(!executor.cancel("t1").await);

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("loop.sh"), "#!/bin/sh\n").unwrap();
        let present = ScriptExecutor::new(
            Arc::new(mock),
            ExecutorConfig {
                program: "./loop.sh".to_string(),
                working_dir: Some(dir.path().to_path_buf()),
                ..ExecutorConfig::default()
            },
        );
        assert!(present.health_check().await);
        assert!(!executor.health_check().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_terminates_running_script() {
        let workspace = TempDir::new().unwrap();
        let script = workspace.path().join("slow.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'Iteration 1'\nsleep 30\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let executor = Arc::new(ScriptExecutor::new(
            Arc::new(crate::subprocess::TokioProcessRunner),
            ExecutorConfig {
                program: script.to_string_lossy().into_owned(),
                ..ExecutorConfig::default()
            },
        ));

        let runner = Arc::clone(&executor);
        let path = workspace.path().to_path_buf();
        let handle = tokio::spawn(async move {
            runner
                .execute(&Task::new("slow", "x"), &path, &ExecuteOptions::default())
                .await
        });

        let mut cancelled = false;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if executor.cancel("slow").await {
                cancelled = true;
                break;
            }
        }
        assert!(cancelled);

        let result = handle.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.final_status, TaskStatus::Cancelled);
    }
}
