//! Typed git command layer
//!
//! `GitClient` owns the protocol of git calls worklane issues. Commands that
//! run in the primary repository go through a single async mutex (the repository
//! queue) because git takes repository-wide locks for worktree registration,
//! branch deletion and checkout. Commands inside a workspace run unserialised.

pub mod error;
pub mod parsers;
pub mod types;

pub use error::GitError;
pub use parsers::*;
pub use types::*;

use crate::subprocess::{ProcessCommandBuilder, ProcessError, ProcessOutput, ProcessRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct GitClient {
    runner: Arc<dyn ProcessRunner>,
    repo_root: PathBuf,
    identity: GitIdentity,
    timeout: Option<Duration>,
    repo_queue: Arc<Mutex<()>>,
}

impl GitClient {
    pub fn new(runner: Arc<dyn ProcessRunner>, repo_root: PathBuf, identity: GitIdentity) -> Self {
        Self {
            runner,
            repo_root,
            identity,
            timeout: None,
            repo_queue: Arc::new(Mutex::new(())),
        }
    }

    /// Bound every command issued through the returned client. The
    /// repository queue is shared with `self`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self.clone()
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn identity(&self) -> &GitIdentity {
        &self.identity
    }

    /// Run git in `dir` and return the raw output, whatever the exit status
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<ProcessOutput, GitError> {
        let mut builder = ProcessCommandBuilder::new("git")
            .args(args)
            .current_dir(dir)
            .envs(self.identity.env());
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        debug!("git {} (in {})", args.join(" "), dir.display());

        self.runner
            .run(builder.build())
            .await
            .map_err(|e| match e {
                ProcessError::Timeout(timeout) => GitError::Timeout {
                    args: args.join(" "),
                    timeout,
                },
                other => GitError::Process(other),
            })
    }

    /// Run git in `dir`, mapping a non-zero exit to a typed error
    async fn run_checked(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = self.run(dir, args).await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
            Err(GitError::classify(&owned, &output.stdout, &output.stderr))
        }
    }

    /// Run git in the primary repository through the repository queue
    async fn run_in_repo(&self, args: &[&str]) -> Result<String, GitError> {
        let _guard = self.repo_queue.lock().await;
        self.run_checked(&self.repo_root, args).await
    }

    pub async fn is_repository(&self, dir: &Path) -> bool {
        matches!(
            self.run(dir, &["rev-parse", "--git-dir"]).await,
            Ok(output) if output.status.success()
        )
    }

    /// `git worktree add -b <branch> <path> <base>`
    pub async fn worktree_add(&self, branch: &str, path: &Path, base: &str) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().into_owned();
        self.run_in_repo(&["worktree", "add", "-b", branch, path_str.as_str(), base])
            .await
            .map(|_| ())
    }

    pub async fn worktree_list(&self) -> Result<Vec<WorktreeEntry>, GitError> {
        let stdout = self.run_in_repo(&["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&stdout))
    }

    pub async fn worktree_remove(&self, path: &Path, force: bool) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_str.as_str());
        self.run_in_repo(&args).await.map(|_| ())
    }

    /// Drop registry entries whose directories are gone. Idempotent.
    pub async fn worktree_prune(&self) -> Result<(), GitError> {
        self.run_in_repo(&["worktree", "prune"]).await.map(|_| ())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        self.run_in_repo(&["branch", "-D", branch]).await.map(|_| ())
    }

    /// Check out `target` in the primary repository and merge `branch` into
    /// it with a merge commit. The queue is held across both steps; a failed
    /// merge is aborted before the error is returned.
    pub async fn merge_into(&self, target: &str, branch: &str, message: &str) -> Result<(), GitError> {
        let _guard = self.repo_queue.lock().await;

        self.run_checked(&self.repo_root, &["checkout", target])
            .await
            .map_err(|e| match e {
                GitError::BranchNotFound(name) => GitError::BranchNotFound(name),
                _ => GitError::CheckoutFailed(target.to_string()),
            })?;

        let result = self
            .run_checked(&self.repo_root, &["merge", "--no-ff", "-m", message, branch])
            .await;

        if let Err(e) = result {
            if let Err(abort_err) = self.run_checked(&self.repo_root, &["merge", "--abort"]).await {
                // No merge in progress is the common case when the merge never started
                debug!("git merge --abort after failed merge: {}", abort_err);
            }
            warn!("Merge of {} into {} failed: {}", branch, target, e);
            return Err(e);
        }

        Ok(())
    }

    pub async fn status(&self, dir: &Path) -> Result<Vec<StatusEntry>, GitError> {
        let stdout = self.run_checked(dir, &["status", "--porcelain"]).await?;
        Ok(parse_status_porcelain(&stdout))
    }

    /// Commits `branch` has that `base` lacks (ahead) and the reverse (behind)
    pub async fn ahead_behind(
        &self,
        dir: &Path,
        base: &str,
        branch: &str,
    ) -> Result<AheadBehind, GitError> {
        let range = format!("{base}...{branch}");
        let stdout = self
            .run_checked(dir, &["rev-list", "--left-right", "--count", range.as_str()])
            .await?;
        parse_left_right_count(&stdout).ok_or_else(|| GitError::CommandFailed {
            args: format!("rev-list --left-right --count {range}"),
            stderr: format!("unexpected output: {}", stdout.trim()),
        })
    }

    pub async fn current_branch(&self, dir: &Path) -> Result<String, GitError> {
        let stdout = self
            .run_checked(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(stdout.trim().to_string())
    }

    pub async fn add_all(&self, dir: &Path) -> Result<(), GitError> {
        self.run_checked(dir, &["add", "-A"]).await.map(|_| ())
    }

    pub async fn commit(&self, dir: &Path, message: &str) -> Result<(), GitError> {
        self.run_checked(dir, &["commit", "-m", message])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::MockProcessRunner;

    fn client(mock: &MockProcessRunner) -> GitClient {
        GitClient::new(
            Arc::new(mock.clone()),
            PathBuf::from("/repo"),
            GitIdentity::default(),
        )
    }

    #[tokio::test]
    async fn test_commands_carry_identity_and_working_dir() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("git").returns_success().finish();

        client(&mock).worktree_prune().await.unwrap();

        let history = mock.get_call_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].args, vec!["worktree", "prune"]);
        assert_eq!(history[0].working_dir.as_deref(), Some(Path::new("/repo")));
        assert_eq!(
            history[0].env.get("GIT_AUTHOR_NAME").map(String::as_str),
            Some("worklane")
        );
        assert_eq!(
            history[0].env.get("GIT_CONFIG_VALUE_0").map(String::as_str),
            Some("false")
        );
    }

    #[tokio::test]
    async fn test_worktree_add_surfaces_branch_exists() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("git")
            .with_args(|args| args.starts_with(&["worktree".to_string(), "add".to_string()]))
            .returns_exit_code(128)
            .returns_stderr("fatal: a branch named 'task/t1' already exists")
            .finish();

        let err = client(&mock)
            .worktree_add("task/t1", Path::new("/repo/.worktrees/t1"), "main")
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::BranchExists(ref b) if b == "task/t1"));
    }

    #[tokio::test]
    async fn test_merge_failure_is_aborted() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("checkout"))
            .returns_success()
            .finish();
        mock.expect_command("git")
            .with_args(|args| args.len() > 1 && args[0] == "merge" && args[1] == "--no-ff")
            .returns_exit_code(1)
            .returns_stdout("CONFLICT (content): Merge conflict in a.txt\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| args == ["merge", "--abort"])
            .returns_success()
            .finish();

        let err = client(&mock)
            .merge_into("main", "task/t1", "Merge task/t1")
            .await
            .unwrap_err();

        assert!(matches!(err, GitError::MergeConflict { .. }));
        assert_eq!(
            mock.recorded_args(),
            vec![
                vec!["checkout", "main"],
                vec!["merge", "--no-ff", "-m", "Merge task/t1", "task/t1"],
                vec!["merge", "--abort"],
            ]
        );
    }

    #[tokio::test]
    async fn test_timeout_maps_to_git_timeout() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("git")
            .returns_timeout(Duration::from_secs(30))
            .finish();

        let err = client(&mock)
            .with_timeout(Duration::from_secs(30))
            .status(Path::new("/repo/.worktrees/t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::Timeout { .. }));
        assert_eq!(
            mock.get_call_history()[0].timeout,
            Some(Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn test_ahead_behind_reads_left_right_counts() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("rev-list"))
            .returns_stdout("1\t3\n")
            .finish();

        let counts = client(&mock)
            .ahead_behind(Path::new("/w"), "origin/main", "task/t1")
            .await
            .unwrap();
        assert_eq!(counts, AheadBehind { ahead: 3, behind: 1 });
        assert_eq!(
            mock.recorded_args()[0],
            vec!["rev-list", "--left-right", "--count", "origin/main...task/t1"]
        );
    }
}
