//! Git data structures

use std::path::PathBuf;

/// One entry of `git worktree list --porcelain`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Commit checked out in the worktree
    pub head: Option<String>,
    /// Short branch name (without `refs/heads/`), `None` when detached or bare
    pub branch: Option<String>,
    pub is_bare: bool,
    pub is_detached: bool,
    pub is_locked: bool,
    /// Registry entry whose directory no longer exists
    pub is_prunable: bool,
}

/// One line of `git status --porcelain`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Two-letter status code, e.g. `" M"`, `"??"`, `"A "`
    pub code: String,
    pub path: PathBuf,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }

    pub fn is_conflicted(&self) -> bool {
        matches!(self.code.as_str(), "UU" | "AA" | "DD" | "AU" | "UA" | "DU" | "UD")
    }
}

/// Commit counts of a branch relative to a base ref
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AheadBehind {
    pub ahead: u32,
    pub behind: u32,
}

/// Identity stamped on every commit worktree operations create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
    pub sign_commits: bool,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            name: "worklane".to_string(),
            email: "worklane@localhost".to_string(),
            sign_commits: false,
        }
    }
}

impl GitIdentity {
    /// Environment handed to every git invocation
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            ("GIT_AUTHOR_NAME".to_string(), self.name.clone()),
            ("GIT_AUTHOR_EMAIL".to_string(), self.email.clone()),
            ("GIT_COMMITTER_NAME".to_string(), self.name.clone()),
            ("GIT_COMMITTER_EMAIL".to_string(), self.email.clone()),
            // Config injected through the environment so argument lists stay untouched
            ("GIT_CONFIG_COUNT".to_string(), "1".to_string()),
            ("GIT_CONFIG_KEY_0".to_string(), "commit.gpgsign".to_string()),
            (
                "GIT_CONFIG_VALUE_0".to_string(),
                self.sign_commits.to_string(),
            ),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ]
    }
}
