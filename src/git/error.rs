//! Git operation error types

use crate::error::{ErrorCode, WorklaneError};
use crate::subprocess::ProcessError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Git-specific errors
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Not a git repository: {0}")]
    NotARepository(PathBuf),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    #[error("Worktree already exists: {0}")]
    WorktreeExists(String),

    #[error("Merge of {branch} failed: {message}")]
    MergeConflict { branch: String, message: String },

    #[error("Checkout of {0} failed")]
    CheckoutFailed(String),

    #[error("Nothing to commit, working tree clean")]
    NothingToCommit,

    #[error("Remote not found: {0}")]
    RemoteNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("git {args} timed out after {timeout:?}")]
    Timeout { args: String, timeout: Duration },

    #[error("git {args} failed: {stderr}")]
    CommandFailed { args: String, stderr: String },

    #[error("Failed to run git: {0}")]
    Process(#[from] ProcessError),
}

impl GitError {
    /// Check if this is a transient error that might succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            GitError::Timeout { .. } => true,
            GitError::CommandFailed { stderr, .. } => stderr.contains(".lock"),
            _ => false,
        }
    }

    /// Map a non-zero git exit to a typed error from its stderr
    pub fn classify(args: &[String], stdout: &str, stderr: &str) -> GitError {
        let joined = args.join(" ");
        let combined = format!("{stderr}\n{stdout}");
        let lower = combined.to_lowercase();
        let subcommand = args.first().map(String::as_str).unwrap_or_default();

        if lower.contains("not a git repository") {
            return GitError::NotARepository(PathBuf::from("."));
        }

        if lower.contains("a branch named") && lower.contains("already exists") {
            return GitError::BranchExists(quoted(&combined).unwrap_or_default());
        }

        if subcommand == "worktree" && lower.contains("already exists") {
            return GitError::WorktreeExists(quoted(&combined).unwrap_or_default());
        }

        if lower.contains("invalid reference")
            || lower.contains("not a valid object name")
            || lower.contains("did not match any file(s) known to git")
            || lower.contains("unknown revision")
        {
            let name = quoted(&combined)
                .or_else(|| after_colon(stderr))
                .unwrap_or_default();
            return GitError::BranchNotFound(name);
        }

        if lower.contains("nothing to commit") {
            return GitError::NothingToCommit;
        }

        if subcommand == "merge"
            && (combined.contains("CONFLICT") || lower.contains("automatic merge failed"))
        {
            let branch = args.last().cloned().unwrap_or_default();
            return GitError::MergeConflict {
                branch,
                message: stderr.trim().to_string(),
            };
        }

        GitError::CommandFailed {
            args: joined,
            stderr: stderr.trim().to_string(),
        }
    }
}

/// First single-quoted token in git's message, e.g. `'task/abc'`
fn quoted(message: &str) -> Option<String> {
    let start = message.find('\'')? + 1;
    let end = message[start..].find('\'')? + start;
    Some(message[start..end].to_string())
}

fn after_colon(message: &str) -> Option<String> {
    message
        .lines()
        .next()
        .and_then(|line| line.rsplit(':').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl From<GitError> for WorklaneError {
    fn from(err: GitError) -> Self {
        let (code, operation) = match &err {
            GitError::NotARepository(_) => (ErrorCode::GIT_REPO_NOT_FOUND, "repository check"),
            GitError::BranchNotFound(_) => (ErrorCode::GIT_BRANCH_NOT_FOUND, "branch lookup"),
            GitError::BranchExists(_) => (ErrorCode::GIT_BRANCH_EXISTS, "branch creation"),
            GitError::WorktreeExists(_) => (ErrorCode::GIT_WORKTREE_ERROR, "worktree creation"),
            GitError::MergeConflict { .. } => (ErrorCode::GIT_MERGE_CONFLICT, "merge"),
            GitError::CheckoutFailed(_) => (ErrorCode::GIT_CHECKOUT_FAILED, "checkout"),
            GitError::NothingToCommit => (ErrorCode::GIT_COMMIT_FAILED, "commit"),
            GitError::RemoteNotFound(_) => (ErrorCode::GIT_REMOTE_ERROR, "remote lookup"),
            GitError::InvalidPath(_) => (ErrorCode::WORKSPACE_INVALID_PATH, "path validation"),
            GitError::Timeout { .. } => (ErrorCode::EXEC_TIMEOUT, "command execution"),
            GitError::CommandFailed { .. } => (ErrorCode::GIT_GENERIC, "command execution"),
            GitError::Process(_) => (ErrorCode::EXEC_SPAWN_FAILED, "command execution"),
        };

        WorklaneError::git(code, err.to_string(), operation).with_source(err)
    }
}
