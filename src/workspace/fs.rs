use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::Path;

/// Filesystem operations the workspace layer performs directly
#[async_trait]
pub trait WorkspaceFs: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;

    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    async fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Creation time of a directory, falling back to its modification time
    async fn created_at(&self, path: &Path) -> Option<DateTime<Utc>>;
}

pub struct TokioFs;

#[async_trait]
impl WorkspaceFs for TokioFs {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_dir_all(path).await
    }

    async fn created_at(&self, path: &Path) -> Option<DateTime<Utc>> {
        let metadata = tokio::fs::metadata(path).await.ok()?;
        metadata
            .created()
            .or_else(|_| metadata.modified())
            .ok()
            .map(DateTime::<Utc>::from)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::subprocess::MockProcessRunner;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory filesystem whose deletions can be made to fail, simulating
    /// files held open by another process
    #[derive(Default)]
    pub struct ScriptedFs {
        dirs: Mutex<HashSet<PathBuf>>,
        created: Mutex<HashMap<PathBuf, DateTime<Utc>>>,
        failing_removals: AtomicUsize,
        removal_attempts: AtomicUsize,
        observer: Option<MockProcessRunner>,
        /// Number of git calls already issued at each removal attempt
        git_calls_at_removal: Mutex<Vec<usize>>,
    }

    impl ScriptedFs {
        pub fn new() -> Self {
            Self::default()
        }

        /// Record how many git calls preceded each removal attempt
        pub fn observing(mock: MockProcessRunner) -> Self {
            Self {
                observer: Some(mock),
                ..Self::default()
            }
        }

        pub fn with_dir(self, path: impl Into<PathBuf>) -> Self {
            self.dirs.lock().unwrap().insert(path.into());
            self
        }

        pub fn with_dir_created(self, path: impl Into<PathBuf>, at: DateTime<Utc>) -> Self {
            let path = path.into();
            self.created.lock().unwrap().insert(path.clone(), at);
            self.with_dir(path)
        }

        /// Make the next `n` removals fail with a lock error
        pub fn fail_removals(self, n: usize) -> Self {
            self.failing_removals.store(n, Ordering::SeqCst);
            self
        }

        pub fn removal_attempts(&self) -> usize {
            self.removal_attempts.load(Ordering::SeqCst)
        }

        pub fn git_calls_at_removal(&self) -> Vec<usize> {
            self.git_calls_at_removal.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkspaceFs for ScriptedFs {
        async fn exists(&self, path: &Path) -> bool {
            self.dirs.lock().unwrap().contains(path)
        }

        async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            self.dirs.lock().unwrap().insert(path.to_path_buf());
            Ok(())
        }

        async fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
            self.removal_attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(mock) = &self.observer {
                self.git_calls_at_removal
                    .lock()
                    .unwrap()
                    .push(mock.get_call_history().len());
            }

            let remaining = self.failing_removals.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_removals.store(remaining - 1, Ordering::SeqCst);
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "resource busy: file is locked",
                ));
            }

            if self.dirs.lock().unwrap().remove(path) {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::NotFound, "no such directory"))
            }
        }

        async fn created_at(&self, path: &Path) -> Option<DateTime<Utc>> {
            self.created.lock().unwrap().get(path).copied()
        }
    }
}
