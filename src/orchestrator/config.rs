use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Tasks running at once in a batch
    pub max_parallel: usize,

    /// How long a task may wait for a rate-limit slot
    #[serde(with = "humantime_serde")]
    pub slot_wait: Duration,

    /// Hard bound on one executor call
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,

    pub dry_run: bool,

    /// Period of the retention sweep for workspaces kept after a task
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            slot_wait: Duration::from_secs(5 * 60),
            task_timeout: Duration::from_secs(60 * 60),
            dry_run: false,
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}
