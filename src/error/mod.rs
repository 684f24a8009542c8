use std::fmt::Display;
use std::path::PathBuf;
use thiserror::Error;

pub mod codes;

pub use codes::{describe_error_code, ErrorCode};

/// The unified error type for the worklane crate
#[derive(Error, Debug)]
pub enum WorklaneError {
    #[error("[E{code:04}] Configuration error: {message}")]
    Config {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Rate limit error: {message}")]
    RateLimit {
        code: u16,
        message: String,
        caller: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Workspace error: {message}")]
    Workspace {
        code: u16,
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Execution error: {message}")]
    Execution {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Pipeline error: {message}")]
    Pipeline {
        code: u16,
        message: String,
        task_id: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Git {operation} failed: {message}")]
    Git {
        code: u16,
        message: String,
        operation: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Validation error: {message}")]
    Validation {
        code: u16,
        message: String,
        field: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl WorklaneError {
    /// Create a configuration error with specific code
    pub fn config_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Admission refused for `caller`
    pub fn rate_limit(code: u16, message: impl Into<String>, caller: Option<String>) -> Self {
        Self::RateLimit {
            code,
            message: message.into(),
            caller,
            source: None,
        }
    }

    /// Create a workspace error with specific code and path
    pub fn workspace_with_code(
        code: u16,
        message: impl Into<String>,
        path: Option<PathBuf>,
    ) -> Self {
        Self::Workspace {
            code,
            message: message.into(),
            path,
            source: None,
        }
    }

    /// Create an execution error with specific code
    pub fn execution_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Execution {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn pipeline(code: u16, message: impl Into<String>, task_id: Option<String>) -> Self {
        Self::Pipeline {
            code,
            message: message.into(),
            task_id,
            source: None,
        }
    }

    /// Create a git error with specific code and operation
    pub fn git(code: u16, message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Git {
            code,
            message: message.into(),
            operation: operation.into(),
            source: None,
        }
    }

    /// Create a validation error with specific code and field
    pub fn validation_with_code(
        code: u16,
        message: impl Into<String>,
        field: Option<String>,
    ) -> Self {
        Self::Validation {
            code,
            message: message.into(),
            field,
            source: None,
        }
    }

    /// Add a source error to this error
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        match &mut self {
            Self::Config { source: src, .. }
            | Self::RateLimit { source: src, .. }
            | Self::Workspace { source: src, .. }
            | Self::Execution { source: src, .. }
            | Self::Pipeline { source: src, .. }
            | Self::Git { source: src, .. }
            | Self::Validation { source: src, .. } => {
                *src = Some(source.into());
            }
        }
        self
    }

    /// Add context to the error message
    pub fn with_context(mut self, context: impl Display) -> Self {
        match &mut self {
            Self::Config { message, .. }
            | Self::RateLimit { message, .. }
            | Self::Workspace { message, .. }
            | Self::Execution { message, .. }
            | Self::Pipeline { message, .. }
            | Self::Git { message, .. }
            | Self::Validation { message, .. } => {
                *message = format!("{}: {}", message, context);
            }
        }
        self
    }

    /// Get the process exit code the binary should use for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 2,
            Self::RateLimit { .. } => 3,
            Self::Workspace { .. } => 4,
            Self::Execution { .. } => 5,
            Self::Pipeline { .. } => 6,
            Self::Git { .. } => 7,
            Self::Validation { .. } => 8,
        }
    }

    /// Get the error code
    pub fn code(&self) -> u16 {
        match self {
            Self::Config { code, .. }
            | Self::RateLimit { code, .. }
            | Self::Workspace { code, .. }
            | Self::Execution { code, .. }
            | Self::Pipeline { code, .. }
            | Self::Git { code, .. }
            | Self::Validation { code, .. } => *code,
        }
    }
}

/// Type alias for Results using WorklaneError
pub type Result<T> = std::result::Result<T, WorklaneError>;

impl From<serde_yaml::Error> for WorklaneError {
    fn from(err: serde_yaml::Error) -> Self {
        WorklaneError::config_with_code(ErrorCode::CONFIG_INVALID_YAML, "Invalid YAML syntax")
            .with_source(err)
    }
}

impl From<serde_json::Error> for WorklaneError {
    fn from(err: serde_json::Error) -> Self {
        WorklaneError::config_with_code(ErrorCode::CONFIG_INVALID_JSON, "Invalid JSON syntax")
            .with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation_and_chaining() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked");
        let err = WorklaneError::workspace_with_code(
            ErrorCode::WORKSPACE_IO_ERROR,
            "Cannot delete directory",
            None,
        )
        .with_source(io_err)
        .with_context("while reclaiming task-1");

        assert_eq!(err.code(), ErrorCode::WORKSPACE_IO_ERROR);
        assert_eq!(
            err.to_string(),
            "[E3004] Workspace error: Cannot delete directory: while reclaiming task-1"
        );
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "locked");
    }

    #[test]
    fn test_errors_without_source_have_none() {
        let err = WorklaneError::pipeline(ErrorCode::PIPELINE_TASK_FAILED, "1 of 2 failed", None);
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn test_error_codes_and_exit_codes() {
        let err = WorklaneError::config_with_code(ErrorCode::CONFIG_NOT_FOUND, "missing");
        assert_eq!(err.code(), ErrorCode::CONFIG_NOT_FOUND);
        assert_eq!(err.exit_code(), 2);

        let err = WorklaneError::git(ErrorCode::GIT_BRANCH_EXISTS, "task/a", "worktree add");
        assert_eq!(err.exit_code(), 7);
        assert_eq!(err.to_string(), "[E6007] Git worktree add failed: task/a");
    }

    #[test]
    fn test_rate_limit_errors_carry_the_caller() {
        let err = WorklaneError::rate_limit(
            ErrorCode::RATE_CIRCUIT_OPEN,
            "Circuit breaker open",
            Some("dev".to_string()),
        );
        assert_eq!(err.exit_code(), 3);
        assert!(matches!(
            &err,
            WorklaneError::RateLimit { caller: Some(caller), .. } if caller == "dev"
        ));
        assert_eq!(err.to_string(), "[E2002] Rate limit error: Circuit breaker open");
    }

    #[test]
    fn test_parse_errors_convert_to_config_codes() {
        let err: WorklaneError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.code(), ErrorCode::CONFIG_INVALID_JSON);
        assert!(std::error::Error::source(&err).is_some());
    }
}
