use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Initializing,
    Running,
    Validating,
    Finalizing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub task_id: String,
    pub phase: ProgressPhase,
    pub message: String,
    pub percentage: Option<f64>,
    pub iteration: Option<u32>,
    pub max_iterations: Option<u32>,
}

impl ProgressEvent {
    pub fn new(task_id: &str, phase: ProgressPhase, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            phase,
            message: message.into(),
            percentage: None,
            iteration: None,
            max_iterations: None,
        }
    }

    pub fn iteration(task_id: &str, iteration: u32, max_iterations: u32) -> Self {
        let percentage = if max_iterations > 0 {
            Some((f64::from(iteration) / f64::from(max_iterations) * 100.0).min(100.0))
        } else {
            None
        };
        Self {
            percentage,
            iteration: Some(iteration),
            max_iterations: Some(max_iterations),
            ..Self::new(
                task_id,
                ProgressPhase::Running,
                format!("Running iteration {iteration}/{max_iterations}"),
            )
        }
    }

    pub fn with_percentage(mut self, percentage: f64) -> Self {
        self.percentage = Some(percentage);
        self
    }
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Fan-out of progress events to every registered callback
#[derive(Default)]
pub struct ProgressHub {
    callbacks: RwLock<Vec<ProgressCallback>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: ProgressCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Deliver `event` to every subscriber. A panicking subscriber is logged
    /// and does not stop delivery to the others.
    pub fn emit(&self, event: &ProgressEvent) {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!("Progress callback panicked on event for task {}", event.task_id);
            }
        }
    }
}
