use crate::error::{ErrorCode, WorklaneError};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Process timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error while running '{command}': {source}")]
    IoError {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {message}")]
    InternalError { message: String },

    #[error("Mock expectation not met: {0}")]
    MockExpectationNotMet(String),
}

impl From<ProcessError> for WorklaneError {
    fn from(err: ProcessError) -> Self {
        let code = match &err {
            ProcessError::CommandNotFound(_) => ErrorCode::EXEC_COMMAND_NOT_FOUND,
            ProcessError::Timeout(_) => ErrorCode::EXEC_TIMEOUT,
            ProcessError::Io(_) | ProcessError::SpawnFailed { .. } => ErrorCode::EXEC_SPAWN_FAILED,
            ProcessError::IoError { .. } => ErrorCode::EXEC_OUTPUT_ERROR,
            ProcessError::InternalError { .. } => ErrorCode::EXEC_ENVIRONMENT_ERROR,
            ProcessError::MockExpectationNotMet(_) => ErrorCode::EXEC_GENERIC,
        };

        WorklaneError::execution_with_code(code, err.to_string()).with_source(err)
    }
}
