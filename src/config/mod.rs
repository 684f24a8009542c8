//! Aggregate configuration for a worklane stack
//!
//! One file (YAML or TOML, chosen by extension) holds every section. Missing
//! sections and keys take their defaults; `WORKLANE_*` environment variables
//! override a few common knobs after loading.

pub mod error;

pub use error::ConfigError;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::executor::ExecutorConfig;
use crate::orchestrator::PipelineConfig;
use crate::ratelimit::RateLimitConfig;
use crate::workspace::{ReclaimConfig, WorktreeConfig, TASK_ID_PLACEHOLDER};

/// File names probed in the repository root when no path is given
pub const DEFAULT_CONFIG_FILES: &[&str] = &["worklane.yml", "worklane.yaml", "worklane.toml"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StackConfig {
    pub rate_limiting: RateLimitConfig,
    pub worktrees: WorktreeConfig,
    pub reclamation: ReclaimConfig,
    pub executor: ExecutorConfig,
    pub pipeline: PipelineConfig,
}

impl StackConfig {
    /// Parse the file at `path`. `.toml` files are read as TOML, `.yml` and
    /// `.yaml` as YAML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let config = match extension.as_deref() {
            Some("yml" | "yaml") => {
                Self::from_yaml(&content).map_err(|source| ConfigError::Yaml {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            Some("toml") => toml::from_str(&content).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })?,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document means every default
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// First of the default file names present in `dir`
    pub fn discover(dir: &Path) -> Option<PathBuf> {
        DEFAULT_CONFIG_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    /// Load `path` when given, else a discovered file in `dir`, else the
    /// defaults. Environment overrides are applied and the result validated.
    pub fn resolve(path: Option<&Path>, dir: &Path) -> Result<Self, ConfigError> {
        let mut config = match path.map(Path::to_path_buf).or_else(|| Self::discover(dir)) {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.merge_env_vars();
        config.validate()?;
        Ok(config)
    }

    pub fn merge_env_vars(&mut self) {
        self.merge_from(|key| std::env::var(key).ok());
    }

    fn merge_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("WORKLANE_MAX_PARALLEL").and_then(|v| v.parse().ok()) {
            self.pipeline.max_parallel = value;
        }

        if let Some(value) = lookup("WORKLANE_RATE_LIMIT_ENABLED").and_then(|v| v.parse().ok()) {
            self.rate_limiting.enabled = value;
        }

        if let Some(value) = lookup("WORKLANE_DRY_RUN").and_then(|v| v.parse().ok()) {
            self.pipeline.dry_run = value;
        }

        if let Some(value) = lookup("WORKLANE_WORKTREE_BASE").filter(|v| !v.is_empty()) {
            self.worktrees.base_path = PathBuf::from(value);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.rate_limiting;
        if limits.max_requests_per_minute == 0 {
            return Err(ConfigError::invalid("rateLimiting.maxRequestsPerMinute", "must be positive"));
        }
        if limits.max_tokens_per_minute == 0 {
            return Err(ConfigError::invalid("rateLimiting.maxTokensPerMinute", "must be positive"));
        }
        if limits.per_agent_limit == 0 {
            return Err(ConfigError::invalid("rateLimiting.perAgentLimit", "must be positive"));
        }
        if limits.per_agent_token_limit == 0 {
            return Err(ConfigError::invalid("rateLimiting.perAgentTokenLimit", "must be positive"));
        }
        if limits.backoff.multiplier.is_nan() || limits.backoff.multiplier < 1.0 {
            return Err(ConfigError::invalid("rateLimiting.backoff.multiplier", "must be at least 1"));
        }
        if limits.circuit_breaker.enabled && limits.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "rateLimiting.circuitBreaker.failureThreshold",
                "must be positive",
            ));
        }

        if !self.worktrees.name_template.contains(TASK_ID_PLACEHOLDER) {
            return Err(ConfigError::invalid(
                "worktrees.nameTemplate",
                format!("must contain {TASK_ID_PLACEHOLDER}"),
            ));
        }
        if !self.worktrees.branch_template.contains(TASK_ID_PLACEHOLDER) {
            return Err(ConfigError::invalid(
                "worktrees.branchTemplate",
                format!("must contain {TASK_ID_PLACEHOLDER}"),
            ));
        }
        if self.worktrees.default_branch.trim().is_empty() {
            return Err(ConfigError::invalid("worktrees.defaultBranch", "must not be empty"));
        }

        if self.reclamation.max_retries == 0 {
            return Err(ConfigError::invalid("reclamation.maxRetries", "must be at least 1"));
        }

        if self.executor.program.trim().is_empty() {
            return Err(ConfigError::invalid("executor.program", "must not be empty"));
        }
        if self.executor.max_concurrent == 0 {
            return Err(ConfigError::invalid("executor.maxConcurrent", "must be positive"));
        }

        if self.pipeline.max_parallel == 0 {
            return Err(ConfigError::invalid("pipeline.maxParallel", "must be positive"));
        }

        Ok(())
    }
}
