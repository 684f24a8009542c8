/// Error code registry for worklane
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration errors
/// - 2000-2999: Rate limiting errors
/// - 3000-3999: Workspace errors
/// - 4000-4999: Execution errors
/// - 5000-5999: Pipeline errors
/// - 6000-6999: Git errors
pub struct ErrorCode;

impl ErrorCode {
    // Configuration errors (1000-1999)
    pub const CONFIG_NOT_FOUND: u16 = 1001;
    pub const CONFIG_INVALID_YAML: u16 = 1002;
    pub const CONFIG_INVALID_JSON: u16 = 1003;
    pub const CONFIG_INVALID_TOML: u16 = 1004;
    pub const CONFIG_INVALID_VALUE: u16 = 1005;
    pub const CONFIG_UNSUPPORTED_FORMAT: u16 = 1006;

    // Rate limiting errors (2000-2999)
    pub const RATE_LIMITED: u16 = 2001;
    pub const RATE_CIRCUIT_OPEN: u16 = 2002;
    pub const RATE_MAX_WAIT_EXCEEDED: u16 = 2003;

    // Workspace errors (3000-3999)
    pub const WORKSPACE_NOT_FOUND: u16 = 3001;
    pub const WORKSPACE_INVALID_PATH: u16 = 3002;
    pub const WORKSPACE_INVALID_TASK_ID: u16 = 3003;
    pub const WORKSPACE_IO_ERROR: u16 = 3004;
    pub const WORKSPACE_RECLAIM_FAILED: u16 = 3005;

    // Execution errors (4000-4999)
    pub const EXEC_GENERIC: u16 = 4000;
    pub const EXEC_COMMAND_NOT_FOUND: u16 = 4001;
    pub const EXEC_TIMEOUT: u16 = 4002;
    pub const EXEC_SUBPROCESS_FAILED: u16 = 4003;
    pub const EXEC_CANCELLED: u16 = 4004;
    pub const EXEC_RATE_LIMITED: u16 = 4006;
    pub const EXEC_SPAWN_FAILED: u16 = 4007;
    pub const EXEC_OUTPUT_ERROR: u16 = 4008;
    pub const EXEC_INCOMPLETE: u16 = 4009;
    pub const EXEC_ENVIRONMENT_ERROR: u16 = 4010;

    // Pipeline errors (5000-5999)
    pub const PIPELINE_GENERIC: u16 = 5000;
    pub const PIPELINE_TASK_FAILED: u16 = 5001;
    pub const PIPELINE_TASK_TIMEOUT: u16 = 5002;
    pub const PIPELINE_TASK_CANCELLED: u16 = 5003;

    // Git errors (6000-6999)
    pub const GIT_GENERIC: u16 = 6000;
    pub const GIT_REPO_NOT_FOUND: u16 = 6001;
    pub const GIT_MERGE_CONFLICT: u16 = 6003;
    pub const GIT_BRANCH_NOT_FOUND: u16 = 6004;
    pub const GIT_CHECKOUT_FAILED: u16 = 6005;
    pub const GIT_COMMIT_FAILED: u16 = 6006;
    pub const GIT_BRANCH_EXISTS: u16 = 6007;
    pub const GIT_REMOTE_ERROR: u16 = 6009;
    pub const GIT_WORKTREE_ERROR: u16 = 6010;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        // Configuration errors
        1001 => "Configuration file not found",
        1002 => "Invalid YAML syntax in configuration",
        1003 => "Invalid JSON syntax in configuration",
        1004 => "Invalid TOML syntax in configuration",
        1005 => "Invalid value in configuration",
        1006 => "Unsupported configuration file format",

        // Rate limiting errors
        2001 => "Rate limit exceeded",
        2002 => "Circuit breaker open",
        2003 => "Maximum wait for a slot exceeded",

        // Workspace errors
        3001 => "Workspace not found",
        3002 => "Workspace path outside the base directory",
        3003 => "Invalid task id",
        3004 => "Workspace I/O error",
        3005 => "Workspace reclamation failed",

        // Execution errors
        4000 => "Generic execution error",
        4001 => "Command not found",
        4002 => "Command execution timeout",
        4003 => "Subprocess failed",
        4004 => "Execution cancelled",
        4006 => "Agent reported a rate limit",
        4007 => "Failed to spawn subprocess",
        4008 => "Command output error",
        4009 => "Executor finished without completing the task",
        4010 => "Command environment error",

        // Pipeline errors
        5000 => "Generic pipeline error",
        5001 => "Task failed",
        5002 => "Task timed out",
        5003 => "Task stopped before execution",

        // Git errors
        6000 => "Generic git error",
        6001 => "Git repository not found",
        6003 => "Git merge conflict",
        6004 => "Git branch not found",
        6005 => "Git checkout failed",
        6006 => "Git commit failed",
        6007 => "Git branch already exists",
        6009 => "Git remote error",
        6010 => "Git worktree error",

        _ => "Unknown error code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_ranges() {
        assert!((1000..2000).contains(&ErrorCode::CONFIG_NOT_FOUND));
        assert!((2000..3000).contains(&ErrorCode::RATE_LIMITED));
        assert!((3000..4000).contains(&ErrorCode::WORKSPACE_NOT_FOUND));
        assert!((4000..5000).contains(&ErrorCode::EXEC_GENERIC));
        assert!((5000..6000).contains(&ErrorCode::PIPELINE_GENERIC));
        assert!((6000..7000).contains(&ErrorCode::GIT_GENERIC));
    }

    #[test]
    fn test_error_code_descriptions() {
        assert_eq!(describe_error_code(1001), "Configuration file not found");
        assert_eq!(describe_error_code(2002), "Circuit breaker open");
        assert_eq!(describe_error_code(4002), "Command execution timeout");
        assert_eq!(describe_error_code(5003), "Task stopped before execution");
        assert_eq!(describe_error_code(65535), "Unknown error code");
    }
}
