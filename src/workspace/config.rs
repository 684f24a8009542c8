use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::git::GitIdentity;

pub const TASK_ID_PLACEHOLDER: &str = "{taskId}";
pub const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";

/// Workspace layout, naming and retention settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorktreeConfig {
    /// Directory holding every workspace; relative paths are resolved
    /// against the repository root
    pub base_path: PathBuf,

    /// Directory name template (`{taskId}`, `{timestamp}` in epoch millis)
    pub name_template: String,

    /// Branch name template (`{taskId}`)
    pub branch_template: String,

    pub default_branch: String,

    pub auto_cleanup: bool,

    pub cleanup_after_success: bool,

    pub cleanup_after_failure: bool,

    #[serde(with = "humantime_serde")]
    pub retention_period: Duration,

    pub git: GitSettings,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(".worktrees"),
            name_template: "{taskId}-{timestamp}".to_string(),
            branch_template: "task/{taskId}".to_string(),
            default_branch: "main".to_string(),
            auto_cleanup: true,
            cleanup_after_success: true,
            cleanup_after_failure: false,
            retention_period: Duration::from_secs(7 * 24 * 60 * 60),
            git: GitSettings::default(),
        }
    }
}

impl WorktreeConfig {
    pub fn render_name(&self, task_id: &str, timestamp_millis: i64) -> String {
        self.name_template
            .replace(TASK_ID_PLACEHOLDER, task_id)
            .replace(TIMESTAMP_PLACEHOLDER, &timestamp_millis.to_string())
    }

    pub fn render_branch(&self, task_id: &str) -> String {
        self.branch_template.replace(TASK_ID_PLACEHOLDER, task_id)
    }

    /// Recover the task id from a branch produced by `render_branch`
    pub fn task_id_from_branch(&self, branch: &str) -> Option<String> {
        let (prefix, suffix) = self.branch_template.split_once(TASK_ID_PLACEHOLDER)?;
        let rest = branch.strip_prefix(prefix)?;
        let task_id = rest.strip_suffix(suffix)?;
        if task_id.is_empty() {
            None
        } else {
            Some(task_id.to_string())
        }
    }

    /// Absolute base directory for a repository rooted at `repo_root`
    pub fn base_dir(&self, repo_root: &std::path::Path) -> PathBuf {
        if self.base_path.is_absolute() {
            self.base_path.clone()
        } else {
            repo_root.join(&self.base_path)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitSettings {
    pub user: String,
    pub email: String,
    pub sign_commits: bool,
}

impl Default for GitSettings {
    fn default() -> Self {
        let identity = GitIdentity::default();
        Self {
            user: identity.name,
            email: identity.email,
            sign_commits: identity.sign_commits,
        }
    }
}

impl From<&GitSettings> for GitIdentity {
    fn from(settings: &GitSettings) -> Self {
        GitIdentity {
            name: settings.user.clone(),
            email: settings.email.clone(),
            sign_commits: settings.sign_commits,
        }
    }
}

/// Settings for crash-resilient workspace deletion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReclaimConfig {
    pub commit_message: String,

    pub delete_branch: bool,

    /// Bound for each git call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Attempts at deleting the directory before giving up
    pub max_retries: u32,

    /// Base of the linear backoff between deletion attempts
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            commit_message: "Auto-save before deletion".to_string(),
            delete_branch: true,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_templates_render_and_invert() {
        let config = WorktreeConfig::default();
        assert_eq!(config.render_name("t-1", 1700000000000), "t-1-1700000000000");
        assert_eq!(config.render_branch("t-1"), "task/t-1");
        assert_eq!(config.task_id_from_branch("task/t-1").as_deref(), Some("t-1"));
        assert_eq!(config.task_id_from_branch("feature/x"), None);
        assert_eq!(config.task_id_from_branch("task/"), None);
    }

    #[test]
    fn test_template_with_suffix_inverts() {
        let config = WorktreeConfig {
            branch_template: "wl/{taskId}/work".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.task_id_from_branch("wl/abc/work").as_deref(),
            Some("abc")
        );
        assert_eq!(config.task_id_from_branch("wl/abc"), None);
    }

    #[test]
    fn test_base_dir_resolution() {
        let config = WorktreeConfig::default();
        assert_eq!(
            config.base_dir(Path::new("/repo")),
            PathBuf::from("/repo/.worktrees")
        );

        let config = WorktreeConfig {
            base_path: PathBuf::from("/var/worklane"),
            ..Default::default()
        };
        assert_eq!(
            config.base_dir(Path::new("/repo")),
            PathBuf::from("/var/worklane")
        );
    }

    #[test]
    fn test_reclaim_defaults() {
        let config = ReclaimConfig::default();
        assert_eq!(config.commit_message, "Auto-save before deletion");
        assert!(config.delete_branch);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(500));
    }
}
