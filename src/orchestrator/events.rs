use serde::Serialize;

use crate::executor::ProgressEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineEventKind {
    Started,
    Phase,
    Progress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    pub kind: PipelineEventKind,
    pub task_id: String,
    pub phase: Option<String>,
    pub message: String,
    pub percentage: Option<f64>,
}

impl PipelineEvent {
    pub fn new(kind: PipelineEventKind, task_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            task_id: task_id.to_string(),
            phase: None,
            message: message.into(),
            percentage: None,
        }
    }

    pub fn phase(task_id: &str, phase: &str, message: impl Into<String>) -> Self {
        Self {
            phase: Some(phase.to_string()),
            ..Self::new(PipelineEventKind::Phase, task_id, message)
        }
    }
}

impl From<&ProgressEvent> for PipelineEvent {
    fn from(progress: &ProgressEvent) -> Self {
        let phase = serde_json::to_value(progress.phase)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string));
        Self {
            phase,
            percentage: progress.percentage,
            ..Self::new(
                PipelineEventKind::Progress,
                &progress.task_id,
                progress.message.clone(),
            )
        }
    }
}
