use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::progress::{ProgressCallback, ProgressEvent, ProgressHub, ProgressPhase};
use super::running::RunningTasks;
use super::{ExecuteOptions, ExecutionFailure, ExecutionResult, Executor};
use crate::error::ErrorCode;
use crate::task::Task;

/// What a [`MockExecutor`] does for a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Succeed,
    Fail(String),
    RateLimited,
    /// Block until cancelled or dropped
    Hang,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub task_id: String,
    pub workspace: PathBuf,
    pub options: ExecuteOptions,
}

struct MockState {
    name: String,
    default_outcome: Mutex<MockOutcome>,
    outcomes: Mutex<HashMap<String, MockOutcome>>,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<MockCall>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    healthy: AtomicBool,
    progress: ProgressHub,
    running: RunningTasks,
}

/// Scriptable executor for orchestration tests
#[derive(Clone)]
pub struct MockExecutor {
    state: Arc<MockState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct InFlight<'a>(&'a MockState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::named("mock")
    }

    pub fn named(name: &str) -> Self {
        Self {
            state: Arc::new(MockState {
                name: name.to_string(),
                default_outcome: Mutex::new(MockOutcome::Succeed),
                outcomes: Mutex::new(HashMap::new()),
                delay: Mutex::new(Duration::ZERO),
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                healthy: AtomicBool::new(true),
                progress: ProgressHub::new(),
                running: RunningTasks::default(),
            }),
        }
    }

    pub fn with_default(self, outcome: MockOutcome) -> Self {
        *lock(&self.state.default_outcome) = outcome;
        self
    }

    pub fn with_outcome(self, task_id: &str, outcome: MockOutcome) -> Self {
        lock(&self.state.outcomes).insert(task_id.to_string(), outcome);
        self
    }

    /// Time each execution takes before returning
    pub fn with_delay(self, delay: Duration) -> Self {
        *lock(&self.state.delay) = delay;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state.calls).clone()
    }

    pub fn executed_task_ids(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.task_id).collect()
    }

    /// Highest number of executions observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    fn outcome_for(&self, task_id: &str) -> MockOutcome {
        lock(&self.state.outcomes)
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| lock(&self.state.default_outcome).clone())
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn name(&self) -> &str {
        &self.state.name
    }

    async fn execute(
        &self,
        task: &Task,
        workspace: &Path,
        options: &ExecuteOptions,
    ) -> ExecutionResult {
        let started = Instant::now();
        lock(&self.state.calls).push(MockCall {
            task_id: task.id.clone(),
            workspace: workspace.to_path_buf(),
            options: options.clone(),
        });
        let _in_flight = InFlight::enter(&self.state);

        self.state.progress.emit(&ProgressEvent::new(
            &task.id,
            ProgressPhase::Initializing,
            "mock starting",
        ));

        let outcome = self.outcome_for(&task.id);
        let delay = *lock(&self.state.delay);
        let cancel = self.state.running.register(&task.id, None);

        let work = async {
            if outcome == MockOutcome::Hang {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(delay).await;
        };
        let cancelled = tokio::select! {
            _ = work => false,
            _ = cancel.notified() => true,
        };
        self.state.running.finish(&task.id);

        if cancelled {
            return ExecutionResult::failed(
                &task.id,
                ExecutionFailure::new(ErrorCode::EXEC_CANCELLED, "Execution cancelled", false),
                started.elapsed(),
            );
        }

        self.state.progress.emit(
            &ProgressEvent::iteration(&task.id, 1, options.max_iterations.max(1)),
        );

        match outcome {
            MockOutcome::Succeed | MockOutcome::Hang => ExecutionResult {
                iterations: 1,
                ..ExecutionResult::succeeded(
                    &task.id,
                    "<promise>COMPLETE</promise>\n",
                    started.elapsed(),
                )
            },
            MockOutcome::Fail(message) => ExecutionResult::failed(
                &task.id,
                ExecutionFailure::new(ErrorCode::EXEC_SUBPROCESS_FAILED, message, true),
                started.elapsed(),
            ),
            MockOutcome::RateLimited => ExecutionResult::failed(
                &task.id,
                ExecutionFailure::new(ErrorCode::EXEC_RATE_LIMITED, "429 Too Many Requests", true),
                started.elapsed(),
            ),
        }
    }

    async fn health_check(&self) -> bool {
        self.state.healthy.load(Ordering::SeqCst)
    }

    async fn capacity(&self) -> usize {
        usize::MAX - self.state.in_flight.load(Ordering::SeqCst)
    }

    async fn cancel(&self, task_id: &str) -> bool {
        self.state.running.cancel(task_id)
    }

    fn on_progress(&self, callback: ProgressCallback) {
        self.state.progress.subscribe(callback);
    }
}
