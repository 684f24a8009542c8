//! Crash-resilient workspace deletion
//!
//! Reclamation runs four steps in a fixed order: preserve uncommitted work,
//! delete the directory (retrying while files are locked), prune git's
//! worktree registry, then optionally delete the branch. Only path
//! validation and directory deletion can fail the reclamation; everything
//! else is collected as warnings.

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::config::ReclaimConfig;
use super::fs::WorkspaceFs;
use super::paths::resolve_within;
use crate::git::GitClient;

pub const INVALID_PATH_WARNING: &str = "Invalid worktree path";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimOptions {
    pub commit_message: String,
    pub delete_branch: bool,
}

impl From<&ReclaimConfig> for ReclaimOptions {
    fn from(config: &ReclaimConfig) -> Self {
        Self {
            commit_message: config.commit_message.clone(),
            delete_branch: config.delete_branch,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimResult {
    pub success: bool,
    pub branch: Option<String>,
    pub auto_committed: bool,
    pub warnings: Vec<String>,
}

pub struct WorkspaceReclaimer {
    git: GitClient,
    fs: Arc<dyn WorkspaceFs>,
    base_dir: PathBuf,
    config: ReclaimConfig,
}

impl WorkspaceReclaimer {
    pub fn new(
        git: &GitClient,
        fs: Arc<dyn WorkspaceFs>,
        base_dir: PathBuf,
        config: ReclaimConfig,
    ) -> Self {
        Self {
            git: git.with_timeout(config.timeout),
            fs,
            base_dir,
            config,
        }
    }

    pub fn default_options(&self) -> ReclaimOptions {
        ReclaimOptions::from(&self.config)
    }

    pub async fn reclaim(
        &self,
        path: &Path,
        branch_hint: Option<&str>,
        options: &ReclaimOptions,
    ) -> ReclaimResult {
        let Some(path) = resolve_within(&self.base_dir, path) else {
            error!(
                "Refusing to reclaim {}: not inside {}",
                path.display(),
                self.base_dir.display()
            );
            return ReclaimResult {
                success: false,
                warnings: vec![INVALID_PATH_WARNING.to_string()],
                ..ReclaimResult::default()
            };
        };

        let mut result = ReclaimResult {
            branch: branch_hint.filter(|b| !b.is_empty()).map(str::to_string),
            ..ReclaimResult::default()
        };

        if self.fs.exists(&path).await {
            match self.git.current_branch(&path).await {
                Ok(branch) if !branch.is_empty() && branch != "HEAD" => {
                    result.branch = Some(branch);
                }
                Ok(_) => {}
                Err(e) => debug!("Could not read branch of {}: {}", path.display(), e),
            }

            match self.preserve_changes(&path, &options.commit_message).await {
                Ok(committed) => result.auto_committed = committed,
                Err(e) => {
                    warn!("Auto-commit in {} failed: {}", path.display(), e);
                    result.warnings.push(format!("Auto-commit failed: {e}"));
                }
            }
        }

        if let Err(e) = self.delete_with_retry(&path, &mut result.warnings).await {
            error!("Giving up on deleting {}: {}", path.display(), e);
            result.warnings.push(format!("Directory deletion failed: {e}"));
            return result;
        }

        if let Err(e) = self.git.worktree_prune().await {
            warn!("git worktree prune failed: {}", e);
            result.warnings.push(format!("Worktree prune failed: {e}"));
        }

        if options.delete_branch {
            if let Some(branch) = &result.branch {
                if let Err(e) = self.git.delete_branch(branch).await {
                    warn!("Deleting branch {} failed: {}", branch, e);
                    result.warnings.push(format!("Branch deletion failed: {e}"));
                }
            }
        }

        result.success = true;
        info!(
            "Reclaimed {} ({} warning(s))",
            path.display(),
            result.warnings.len()
        );
        result
    }

    /// Commit everything in the workspace if it is dirty. Returns whether a
    /// commit was made.
    async fn preserve_changes(&self, path: &Path, message: &str) -> Result<bool, crate::git::GitError> {
        let changes = self.git.status(path).await?;
        if changes.is_empty() {
            return Ok(false);
        }

        debug!(
            "Auto-committing {} change(s) in {}",
            changes.len(),
            path.display()
        );
        self.git.add_all(path).await?;
        self.git.commit(path, message).await?;
        Ok(true)
    }

    async fn delete_with_retry(&self, path: &Path, warnings: &mut Vec<String>) -> io::Result<()> {
        let max_attempts = self.config.max_retries.max(1);

        for attempt in 1..=max_attempts {
            if !self.fs.exists(path).await {
                return Ok(());
            }

            let err = match self.fs.remove_dir_all(path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => e,
            };

            if attempt == max_attempts {
                return Err(err);
            }

            warn!(
                "Deleting {} failed (attempt {}/{}): {}",
                path.display(),
                attempt,
                max_attempts,
                err
            );
            warnings.push(format!(
                "Directory deletion attempt {attempt}/{max_attempts} failed: {err}"
            ));
            tokio::time::sleep(self.config.retry_delay * attempt).await;
        }

        Ok(())
    }
}
