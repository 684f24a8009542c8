//! # worklane
//!
//! Run coding-agent tasks in parallel, each in its own git worktree, behind
//! a token-bucket rate limiter with a per-caller circuit breaker.
//!
//! ## Modules
//!
//! - `config` - Aggregate YAML/TOML configuration with environment overrides
//! - `error` - Crate-wide error type with stable numeric codes
//! - `executor` - Agent executors (shell script loop, Claude CLI) behind one trait
//! - `git` - Typed git command layer with a serialised repository queue
//! - `orchestrator` - Per-task lifecycle and bounded-concurrency batches
//! - `ratelimit` - Token buckets, admission decisions and circuit breaking
//! - `subprocess` - Process execution abstraction with a scriptable mock
//! - `task` - Task model and task-file loading
//! - `workspace` - Worktree creation, listing, merging and crash-safe reclamation
pub mod config;
pub mod error;
pub mod executor;
pub mod git;
pub mod orchestrator;
pub mod ratelimit;
pub mod subprocess;
pub mod task;
pub mod workspace;

pub use config::StackConfig;
pub use error::{ErrorCode, Result, WorklaneError};
pub use orchestrator::Orchestrator;
