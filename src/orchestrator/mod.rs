//! Task lifecycle and batch orchestration
//!
//! For every task the orchestrator waits for a rate-limit slot, creates a
//! workspace, runs the executor under a timeout, reports the result back to
//! the limiter and applies the retention policy to the workspace.

pub mod config;
pub mod events;
pub mod outcome;

pub use config::PipelineConfig;
pub use events::{PipelineEvent, PipelineEventKind};
pub use outcome::{TaskError, TaskOutcome, TaskPhase};

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::StackConfig;
use crate::error::{ErrorCode, WorklaneError};
use crate::executor::{
    build_executor, ExecuteOptions, ExecutionFailure, ExecutionResult, Executor, ProgressEvent,
};
use crate::subprocess::ProcessRunner;
use crate::ratelimit::{is_rate_limit_signal, LimiterStatus, RateLimiter, RejectReason};
use crate::task::Task;
use crate::workspace::{ReclaimResult, WorkspaceInfo, WorkspaceManager};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub running: Vec<String>,
    pub rate_limits: LimiterStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: BTreeMap<String, bool>,
}

/// Stop request for one in-flight task
#[derive(Default)]
struct StopSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        let notified = self.notify.notified();
        if self.is_requested() {
            return;
        }
        notified.await;
    }
}

type InFlight = Arc<RwLock<HashMap<String, Arc<StopSignal>>>>;

/// Periodic retention sweep; stops when dropped
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct Orchestrator {
    limiter: Arc<RateLimiter>,
    workspaces: Arc<WorkspaceManager>,
    executor: Arc<dyn Executor>,
    config: PipelineConfig,
    execute_options: ExecuteOptions,
    running: InFlight,
    events: broadcast::Sender<PipelineEvent>,
}

impl Orchestrator {
    pub fn new(
        limiter: Arc<RateLimiter>,
        workspaces: Arc<WorkspaceManager>,
        executor: Arc<dyn Executor>,
        config: PipelineConfig,
        execute_options: ExecuteOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let forward = events.clone();
        executor.on_progress(Arc::new(move |progress: &ProgressEvent| {
            // No subscribers is fine
            let _ = forward.send(PipelineEvent::from(progress));
        }));

        Self {
            limiter,
            workspaces,
            executor,
            config,
            execute_options,
            running: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Wire a limiter, a workspace manager and the configured executor for
    /// the repository at `repo_root`. Must be called inside a tokio runtime
    /// for the limiter's background refill to start.
    pub fn from_config(
        config: &StackConfig,
        repo_root: PathBuf,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limiting.clone()));
        let workspaces = Arc::new(WorkspaceManager::new(
            Arc::clone(&runner),
            repo_root,
            config.worktrees.clone(),
            config.reclamation.clone(),
        ));
        let executor = build_executor(&config.executor, runner);
        Self::new(
            limiter,
            workspaces,
            executor,
            config.pipeline.clone(),
            config.executor.options(),
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    fn caller_for<'a>(&'a self, task: &'a Task) -> &'a str {
        task.assigned_agent
            .as_deref()
            .unwrap_or_else(|| self.executor.name())
    }

    /// Run one task through its whole lifecycle. Never returns an error;
    /// every failure is described by the outcome.
    pub async fn process_task(&self, task: &Task) -> TaskOutcome {
        let started = Instant::now();
        let caller = self.caller_for(task);
        self.emit(PipelineEvent::new(
            PipelineEventKind::Started,
            &task.id,
            format!("Starting task {}", task.title),
        ));

        let stop = Arc::new(StopSignal::default());
        self.running
            .write()
            .await
            .insert(task.id.clone(), Arc::clone(&stop));
        let outcome = self.run_registered(task, caller, &stop, started).await;
        self.running.write().await.remove(&task.id);

        if outcome.success {
            self.emit(PipelineEvent::new(
                PipelineEventKind::Completed,
                &task.id,
                "Task completed successfully",
            ));
        } else {
            let message = outcome
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "Task failed".to_string());
            self.emit(PipelineEvent::new(PipelineEventKind::Failed, &task.id, message));
        }
        outcome
    }

    async fn run_registered(
        &self,
        task: &Task,
        caller: &str,
        stop: &StopSignal,
        started: Instant,
    ) -> TaskOutcome {
        self.emit(PipelineEvent::phase(&task.id, "admission", "Waiting for a rate-limit slot"));
        let decision = tokio::select! {
            decision = self.limiter.wait_for_slot(caller, 1, self.config.slot_wait) => decision,
            _ = stop.wait() => {
                return self.cancelled(task, TaskPhase::Admission, started);
            }
        };
        if !decision.allowed {
            let reason = decision.reason.unwrap_or(RejectReason::GlobalLimit);
            warn!("Task {} not admitted for {}: {}", task.id, caller, reason);
            let err = WorklaneError::rate_limit(
                reason.code(),
                reason.to_string(),
                Some(caller.to_string()),
            );
            return TaskOutcome::rejected(
                &task.id,
                TaskPhase::Admission,
                TaskError::from(&err),
                started.elapsed(),
            );
        }
        if stop.is_requested() {
            return self.cancelled(task, TaskPhase::Admission, started);
        }

        self.emit(PipelineEvent::phase(&task.id, "workspace", "Creating workspace"));
        let workspace = match self.workspaces.create(&task.id, None).await {
            Ok(workspace) => workspace,
            Err(e) => {
                let err = WorklaneError::from(e);
                error!("Workspace for task {} could not be created: {}", task.id, err);
                return TaskOutcome::rejected(
                    &task.id,
                    TaskPhase::Workspace,
                    TaskError::from(&err),
                    started.elapsed(),
                );
            }
        };

        if stop.is_requested() {
            self.workspaces.mark_inactive(&task.id).await;
            let reclaim = self.apply_retention(&workspace, false).await;
            return TaskOutcome {
                workspace: Some(workspace),
                reclaim,
                ..self.cancelled(task, TaskPhase::Workspace, started)
            };
        }

        self.emit(PipelineEvent::phase(&task.id, "execution", "Running executor"));
        let options = ExecuteOptions {
            dry_run: self.execute_options.dry_run || self.config.dry_run,
            branch: Some(workspace.branch.clone()),
            ..self.execute_options.clone()
        };
        let (execution, timed_out) = match tokio::time::timeout(
            self.config.task_timeout,
            self.executor.execute(task, &workspace.path, &options),
        )
        .await
        {
            Ok(result) => (result, false),
            Err(_) => {
                warn!(
                    "Task {} exceeded {:?}; cancelling executor",
                    task.id, self.config.task_timeout
                );
                self.executor.cancel(&task.id).await;
                let failure = ExecutionFailure::new(
                    ErrorCode::EXEC_TIMEOUT,
                    format!("Task timed out after {:?}", self.config.task_timeout),
                    true,
                );
                (
                    ExecutionResult::failed(&task.id, failure, self.config.task_timeout),
                    true,
                )
            }
        };

        if execution.success {
            self.limiter.report_success(caller).await;
        } else {
            let rate_limited =
                execution.is_rate_limited() || is_rate_limit_signal(&execution.stderr);
            self.limiter.report_failure(caller, rate_limited).await;
        }

        self.workspaces.mark_inactive(&task.id).await;
        let reclaim = self.apply_retention(&workspace, execution.success).await;

        let (phase, error) = if execution.success {
            (TaskPhase::Complete, None)
        } else {
            let error = execution
                .error
                .as_ref()
                .map(|failure| TaskError {
                    code: if timed_out {
                        ErrorCode::PIPELINE_TASK_TIMEOUT
                    } else {
                        failure.code
                    },
                    message: failure.message.clone(),
                })
                .unwrap_or_else(|| TaskError {
                    code: ErrorCode::PIPELINE_TASK_FAILED,
                    message: "Executor reported failure".to_string(),
                });
            let phase = if timed_out {
                TaskPhase::Execution
            } else {
                TaskPhase::Failed
            };
            (phase, Some(error))
        };

        info!(
            "Task {} finished in {:?}: {:?}",
            task.id,
            started.elapsed(),
            phase
        );

        TaskOutcome {
            task_id: task.id.clone(),
            success: execution.success,
            phase,
            execution: Some(execution),
            error,
            duration: started.elapsed(),
            workspace: Some(workspace),
            reclaim,
        }
    }

    /// Reclaim now when the policy says so; otherwise the workspace waits
    /// for the retention sweep
    async fn apply_retention(&self, workspace: &WorkspaceInfo, success: bool) -> Option<ReclaimResult> {
        let policy = self.workspaces.config();
        let reclaim_now = policy.auto_cleanup
            && if success {
                policy.cleanup_after_success
            } else {
                policy.cleanup_after_failure
            };
        if !reclaim_now {
            debug!(
                "Keeping workspace {} until the retention sweep",
                workspace.path.display()
            );
            return None;
        }

        let options = self.workspaces.default_reclaim_options();
        match self.workspaces.reclaim(&workspace.task_id, &options).await {
            Ok(result) => {
                if !result.success {
                    warn!(
                        "Reclaiming {} failed: {}",
                        workspace.path.display(),
                        result.warnings.join("; ")
                    );
                }
                Some(result)
            }
            Err(e) => {
                warn!("Reclaiming {} failed: {}", workspace.path.display(), e);
                None
            }
        }
    }

    fn cancelled(&self, task: &Task, phase: TaskPhase, started: Instant) -> TaskOutcome {
        info!("Task {} stopped before execution", task.id);
        let err = WorklaneError::pipeline(
            ErrorCode::PIPELINE_TASK_CANCELLED,
            "Task stopped before execution",
            Some(task.id.clone()),
        );
        TaskOutcome::rejected(&task.id, phase, TaskError::from(&err), started.elapsed())
    }

    /// Run every task, at most `max_parallel` at a time. Outcomes are in
    /// input order; one task's failure does not affect the others.
    pub async fn process_batch(&self, tasks: &[Task]) -> Vec<TaskOutcome> {
        let semaphore = Semaphore::new(self.config.max_parallel.max(1));
        let batch_id = Uuid::new_v4();
        info!(
            "Batch {} processing {} task(s), {} at a time",
            batch_id,
            tasks.len(),
            self.config.max_parallel.max(1)
        );

        let lifecycles = tasks.iter().map(|task| {
            let semaphore = &semaphore;
            async move {
                // The semaphore is never closed
                let _permit = semaphore.acquire().await.ok();
                self.process_task(task).await
            }
        });
        let outcomes = futures::future::join_all(lifecycles).await;
        info!(
            "Batch {} finished: {}/{} succeeded",
            batch_id,
            outcomes.iter().filter(|o| o.success).count(),
            outcomes.len()
        );
        outcomes
    }

    pub async fn status(&self) -> PipelineStatus {
        let mut running: Vec<String> = self.running.read().await.keys().cloned().collect();
        running.sort();
        PipelineStatus {
            running,
            rate_limits: self.limiter.status().await,
        }
    }

    /// Stop `task_id` wherever it is in its lifecycle. A task still waiting
    /// for admission or a workspace never reaches the executor; a running
    /// one is cancelled and its own lifecycle still reports and reclaims.
    /// Returns false when the task is not in flight.
    pub async fn stop_task(&self, task_id: &str) -> bool {
        let Some(stop) = self.running.read().await.get(task_id).cloned() else {
            return false;
        };
        stop.request();
        let cancelled = self.executor.cancel(task_id).await;
        info!(
            "Stop requested for task {}{}",
            task_id,
            if cancelled { " (executor cancelled)" } else { "" }
        );
        true
    }

    pub async fn stop_all(&self) -> usize {
        let ids: Vec<String> = self.running.read().await.keys().cloned().collect();
        let mut stopped = 0;
        for id in ids {
            if self.stop_task(&id).await {
                stopped += 1;
            }
        }
        stopped
    }

    pub async fn health_check(&self) -> HealthReport {
        let mut components = BTreeMap::new();
        components.insert("executor".to_string(), self.executor.health_check().await);

        let repo_root: PathBuf = self.workspaces.repo_root().to_path_buf();
        let repository = repo_root.is_dir() && self.workspaces.git().is_repository(&repo_root).await;
        components.insert("repository".to_string(), repository);

        let base_dir = self.workspaces.base_dir();
        let creatable = tokio::fs::create_dir_all(base_dir).await.is_ok();
        components.insert("worktreesPath".to_string(), creatable);

        HealthReport {
            healthy: components.values().all(|ok| *ok),
            components,
        }
    }

    /// Run the workspace retention sweep every `interval`, leaving the
    /// workspaces of in-flight tasks alone
    pub fn start_sweeper(&self, interval: Duration) -> SweeperHandle {
        let workspaces = Arc::clone(&self.workspaces);
        let running = Arc::clone(&self.running);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let in_use: HashSet<String> = running.read().await.keys().cloned().collect();
                match workspaces.cleanup_excluding(&in_use).await {
                    Ok(removed) => debug!("Retention sweep removed {} workspace(s)", removed),
                    Err(e) => warn!("Retention sweep failed: {}", e),
                }
            }
        });
        SweeperHandle { task }
    }
}
