use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::config::{ReclaimConfig, WorktreeConfig};
use super::error::WorkspaceError;
use super::fs::{TokioFs, WorkspaceFs};
use super::paths::{resolve_within, validate_task_id};
use super::reclaim::{ReclaimOptions, ReclaimResult, WorkspaceReclaimer};
use super::{MergeOutcome, RemoveOutcome, WorkspaceInfo, WorkspaceStatus};
use crate::git::{GitClient, GitIdentity};
use crate::subprocess::ProcessRunner;

pub struct WorkspaceManager {
    git: GitClient,
    fs: Arc<dyn WorkspaceFs>,
    config: WorktreeConfig,
    base_dir: PathBuf,
    reclaimer: WorkspaceReclaimer,
    index: RwLock<HashMap<String, WorkspaceInfo>>,
}

impl WorkspaceManager {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        repo_root: PathBuf,
        config: WorktreeConfig,
        reclaim: ReclaimConfig,
    ) -> Self {
        Self::with_fs(runner, repo_root, config, reclaim, Arc::new(TokioFs))
    }

    pub fn with_fs(
        runner: Arc<dyn ProcessRunner>,
        repo_root: PathBuf,
        config: WorktreeConfig,
        reclaim: ReclaimConfig,
        fs: Arc<dyn WorkspaceFs>,
    ) -> Self {
        let git = GitClient::new(runner, repo_root.clone(), GitIdentity::from(&config.git));
        let base_dir = config.base_dir(&repo_root);
        let reclaimer = WorkspaceReclaimer::new(&git, Arc::clone(&fs), base_dir.clone(), reclaim);

        Self {
            git,
            fs,
            config,
            base_dir,
            reclaimer,
            index: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WorktreeConfig {
        &self.config
    }

    pub fn repo_root(&self) -> &Path {
        self.git.repo_root()
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn git(&self) -> &GitClient {
        &self.git
    }

    pub fn default_reclaim_options(&self) -> ReclaimOptions {
        self.reclaimer.default_options()
    }

    /// Create a workspace for `task_id` on a fresh branch cut from
    /// `base_branch` (the configured default branch when `None`)
    pub async fn create(
        &self,
        task_id: &str,
        base_branch: Option<&str>,
    ) -> Result<WorkspaceInfo, WorkspaceError> {
        validate_task_id(task_id).map_err(|reason| WorkspaceError::InvalidTaskId {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        })?;

        let created_at = Utc::now();
        let name = self
            .config
            .render_name(task_id, created_at.timestamp_millis());
        let branch = self.config.render_branch(task_id);
        let candidate = self.base_dir.join(&name);
        let path =
            resolve_within(&self.base_dir, &candidate).ok_or_else(|| WorkspaceError::InvalidPath {
                path: candidate.clone(),
                base: self.base_dir.clone(),
            })?;

        self.fs
            .create_dir_all(&self.base_dir)
            .await
            .map_err(|source| WorkspaceError::Io {
                path: self.base_dir.clone(),
                source,
            })?;

        let base = base_branch.unwrap_or(&self.config.default_branch);
        self.git.worktree_add(&branch, &path, base).await?;

        let info = WorkspaceInfo {
            path,
            branch,
            task_id: task_id.to_string(),
            created_at,
            is_active: true,
        };
        self.index
            .write()
            .await
            .insert(task_id.to_string(), info.clone());

        info!(
            "Created workspace {} on branch {} from {}",
            info.path.display(),
            info.branch,
            base
        );
        Ok(info)
    }

    /// Index lookup only
    pub async fn get(&self, task_id: &str) -> Option<WorkspaceInfo> {
        self.index.read().await.get(task_id).cloned()
    }

    pub async fn exists(&self, task_id: &str) -> Result<bool, WorkspaceError> {
        Ok(self.resolve(task_id).await?.is_some())
    }

    pub async fn path(&self, task_id: &str) -> Result<Option<PathBuf>, WorkspaceError> {
        Ok(self.resolve(task_id).await?.map(|info| info.path))
    }

    /// Mark the workspace as no longer in use by a running task
    pub async fn mark_inactive(&self, task_id: &str) {
        if let Some(info) = self.index.write().await.get_mut(task_id) {
            info.is_active = false;
        }
    }

    /// List workspaces registered with git under the base directory and
    /// rebuild the index from them
    pub async fn list(&self) -> Result<Vec<WorkspaceInfo>, WorkspaceError> {
        let entries = self.git.worktree_list().await?;
        let known = self.index.read().await.clone();

        let mut discovered = HashMap::new();
        for entry in entries {
            if entry.is_bare {
                continue;
            }
            let Some(path) = resolve_within(&self.base_dir, &entry.path) else {
                continue;
            };

            let branch = entry.branch.clone().unwrap_or_default();
            let task_id = self
                .config
                .task_id_from_branch(&branch)
                .or_else(|| (!branch.is_empty()).then(|| branch.clone()))
                .or_else(|| {
                    path.file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                });
            let Some(task_id) = task_id else {
                continue;
            };

            let indexed = known.get(&task_id);
            let created_at = match indexed {
                Some(info) => info.created_at,
                None => self.fs.created_at(&path).await.unwrap_or_else(Utc::now),
            };
            let is_active = indexed.is_some_and(|info| info.is_active);

            discovered.insert(
                task_id.clone(),
                WorkspaceInfo {
                    path,
                    branch,
                    task_id,
                    created_at,
                    is_active,
                },
            );
        }

        let mut index = self.index.write().await;
        let mut dropped = 0;
        for (task_id, info) in index.drain() {
            match discovered.get_mut(&task_id) {
                Some(found) => found.is_active = info.is_active,
                // Created while the registry was being read
                None if !known.contains_key(&task_id) => {
                    discovered.insert(task_id, info);
                }
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            debug!("Dropped {} vanished workspace(s) from the index", dropped);
        }
        *index = discovered;
        let mut workspaces: Vec<WorkspaceInfo> = index.values().cloned().collect();
        drop(index);

        workspaces.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.task_id.cmp(&b.task_id)));
        Ok(workspaces)
    }

    /// Index first, then a registry rescan
    async fn resolve(&self, task_id: &str) -> Result<Option<WorkspaceInfo>, WorkspaceError> {
        if let Some(info) = self.get(task_id).await {
            return Ok(Some(info));
        }
        self.list().await?;
        Ok(self.get(task_id).await)
    }

    async fn require(&self, task_id: &str) -> Result<WorkspaceInfo, WorkspaceError> {
        self.resolve(task_id)
            .await?
            .ok_or_else(|| WorkspaceError::UnknownWorkspace(task_id.to_string()))
    }

    /// Remove the workspace and its branch. Returns `None` for an unknown
    /// task. With `force`, a failing `git worktree remove` falls back to
    /// reclamation.
    pub async fn remove(
        &self,
        task_id: &str,
        force: bool,
    ) -> Result<Option<RemoveOutcome>, WorkspaceError> {
        let Some(info) = self.resolve(task_id).await? else {
            return Ok(None);
        };
        let path = resolve_within(&self.base_dir, &info.path).ok_or_else(|| {
            WorkspaceError::InvalidPath {
                path: info.path.clone(),
                base: self.base_dir.clone(),
            }
        })?;

        let mut warnings = Vec::new();
        match self.git.worktree_remove(&path, force).await {
            Ok(()) => {
                if !info.branch.is_empty() {
                    if let Err(e) = self.git.delete_branch(&info.branch).await {
                        warn!("Deleting branch {} failed: {}", info.branch, e);
                        warnings.push(format!("Branch deletion failed: {e}"));
                    }
                }
            }
            Err(e) if force => {
                warn!(
                    "git worktree remove failed for {}, reclaiming instead: {}",
                    path.display(),
                    e
                );
                warnings.push(format!("Worktree remove failed: {e}"));

                let options = ReclaimOptions {
                    delete_branch: true,
                    ..self.reclaimer.default_options()
                };
                let result = self
                    .reclaimer
                    .reclaim(&path, Some(&info.branch), &options)
                    .await;
                warnings.extend(result.warnings);
                if !result.success {
                    return Err(WorkspaceError::ReclaimFailed { warnings });
                }
            }
            Err(e) => return Err(e.into()),
        }

        self.index.write().await.remove(task_id);
        info!("Removed workspace for task {}", task_id);

        Ok(Some(RemoveOutcome {
            branch: info.branch,
            warnings,
        }))
    }

    /// Reclaim the workspace of `task_id`; the index entry is dropped only
    /// when reclamation succeeds
    pub async fn reclaim(
        &self,
        task_id: &str,
        options: &ReclaimOptions,
    ) -> Result<ReclaimResult, WorkspaceError> {
        let info = self.require(task_id).await?;
        let result = self
            .reclaimer
            .reclaim(&info.path, Some(&info.branch), options)
            .await;
        if result.success {
            self.index.write().await.remove(task_id);
        }
        Ok(result)
    }

    /// Merge the task branch into `target` (the default branch when `None`)
    /// with a merge commit, then optionally remove the workspace
    pub async fn merge(
        &self,
        task_id: &str,
        target: Option<&str>,
        delete_after: bool,
    ) -> Result<MergeOutcome, WorkspaceError> {
        let info = self.require(task_id).await?;
        let target = target.unwrap_or(&self.config.default_branch).to_string();
        let message = format!("Merge {}", info.branch);

        self.git.merge_into(&target, &info.branch, &message).await?;
        info!("Merged {} into {}", info.branch, target);

        let removed = if delete_after {
            self.remove(task_id, true).await?
        } else {
            None
        };

        Ok(MergeOutcome {
            branch: info.branch,
            target,
            removed,
        })
    }

    /// Remove every workspace older than the retention period, then prune
    /// stale registry entries. Returns how many workspaces were removed.
    pub async fn cleanup(&self) -> Result<usize, WorkspaceError> {
        self.cleanup_excluding(&HashSet::new()).await
    }

    /// `cleanup()` that leaves the workspaces of `in_use` task ids alone
    pub async fn cleanup_excluding(
        &self,
        in_use: &HashSet<String>,
    ) -> Result<usize, WorkspaceError> {
        let retention = chrono::Duration::from_std(self.config.retention_period)
            .unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let expired: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .filter(|info| !in_use.contains(&info.task_id) && now - info.created_at > retention)
            .map(|info| info.task_id)
            .collect();

        let mut removed = 0;
        for task_id in expired {
            match self.remove(&task_id, true).await {
                Ok(Some(_)) => removed += 1,
                Ok(None) => {}
                Err(e) => warn!("Cleanup of workspace {} failed: {}", task_id, e),
            }
        }

        if let Err(e) = self.git.worktree_prune().await {
            warn!("git worktree prune failed during cleanup: {}", e);
        }

        if removed > 0 {
            info!("Cleanup removed {} expired workspace(s)", removed);
        }
        Ok(removed)
    }

    /// Uncommitted changes and commit counts relative to the remote
    /// default branch. A missing remote reads as 0/0.
    pub async fn status(&self, task_id: &str) -> Result<WorkspaceStatus, WorkspaceError> {
        let info = self.require(task_id).await?;
        let changes = self.git.status(&info.path).await?;

        let base = format!("origin/{}", self.config.default_branch);
        let counts = match self.git.ahead_behind(&info.path, &base, &info.branch).await {
            Ok(counts) => counts,
            Err(e) => {
                debug!("No ahead/behind for {} against {}: {}", info.branch, base, e);
                Default::default()
            }
        };

        Ok(WorkspaceStatus {
            has_changes: !changes.is_empty(),
            ahead: counts.ahead,
            behind: counts.behind,
        })
    }
}
