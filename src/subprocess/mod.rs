//! Process execution layer.
//!
//! Every external program worklane launches (git, the agent CLI, scripts)
//! goes through a [`ProcessRunner`]. The tokio implementation starts each
//! child with a cleared environment, so only what the caller lists is visible
//! to the workspace.

pub mod builder;
pub mod error;
pub mod mock;
pub mod runner;

pub use builder::ProcessCommandBuilder;
pub use error::ProcessError;
pub use mock::{MockCommandConfig, MockProcessRunner};
pub use runner::{
    ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, ProcessStream, TokioProcessRunner,
};
