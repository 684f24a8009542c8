//! Units of work handed to the orchestrator
//!
//! Tasks come from external adapters as JSON or YAML, either as a bare list
//! or wrapped in a `tasks:` key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{ErrorCode, Result, WorklaneError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptanceCriterion {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    #[serde(default)]
    pub status: TaskStatus,
    /// 1 is the highest priority
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_priority() -> u8 {
    3
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            status: TaskStatus::Pending,
            priority: default_priority(),
            depends_on: Vec::new(),
            assigned_agent: None,
            notes: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.assigned_agent = Some(agent.into());
        self
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria
            .into_iter()
            .enumerate()
            .map(|(i, description)| AcceptanceCriterion {
                id: format!("AC-{}", i + 1),
                description: description.into(),
                passed: false,
            })
            .collect();
        self
    }

    /// Whether the orchestrator should pick this task up
    pub fn is_runnable(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Failed
        )
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    List(Vec<Task>),
    Wrapped { tasks: Vec<Task> },
}

impl From<TaskFile> for Vec<Task> {
    fn from(file: TaskFile) -> Self {
        match file {
            TaskFile::List(tasks) | TaskFile::Wrapped { tasks } => tasks,
        }
    }
}

/// Parse tasks from a string; `.json` content is detected by extension,
/// everything else is read as YAML (a superset of JSON)
pub fn parse_tasks(content: &str, json: bool) -> Result<Vec<Task>> {
    let file: TaskFile = if json {
        serde_json::from_str(content)?
    } else {
        serde_yaml::from_str(content)?
    };
    Ok(file.into())
}

pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        WorklaneError::config_with_code(
            ErrorCode::CONFIG_NOT_FOUND,
            format!("Cannot read task file {}", path.display()),
        )
        .with_source(e)
    })?;
    let json = path.extension().is_some_and(|ext| ext == "json");
    parse_tasks(&content, json).map_err(|e| e.with_context(path.display()))
}
