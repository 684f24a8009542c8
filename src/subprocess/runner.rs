use async_trait::async_trait;
use futures::stream::Stream;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use super::error::ProcessError;

#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
}

impl ProcessCommand {
    /// Render the command line for log and error messages
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Timeout,
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            _ => None,
        }
    }
}

pub type ProcessStreamItem = Result<String, ProcessError>;
pub type ProcessStreamFut = Pin<Box<dyn Stream<Item = ProcessStreamItem> + Send>>;

pub struct ProcessStream {
    /// OS process id, used for signalling the process group
    pub pid: Option<u32>,
    pub stdout: ProcessStreamFut,
    pub stderr: ProcessStreamFut,
    pub status: Pin<Box<dyn futures::Future<Output = Result<ExitStatus, ProcessError>> + Send>>,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError>;
    async fn run_streaming(&self, command: ProcessCommand) -> Result<ProcessStream, ProcessError>;
}

pub struct TokioProcessRunner;

impl TokioProcessRunner {
    /// Normalize a line by removing trailing newlines
    fn normalize_line(mut line: String) -> String {
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        line
    }

    fn create_line_stream<R>(reader: tokio::io::BufReader<R>, command: String) -> ProcessStreamFut
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
    {
        use tokio::io::AsyncBufReadExt;

        Box::pin(futures::stream::unfold(
            (reader, command),
            |(mut reader, command)| async move {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => None,
                    Ok(_) => Some((Ok(Self::normalize_line(line)), (reader, command))),
                    Err(e) => Some((
                        Err(ProcessError::IoError {
                            command: command.clone(),
                            source: e,
                        }),
                        (reader, command),
                    )),
                }
            },
        )) as ProcessStreamFut
    }

    /// Create a status future with optional timeout
    fn create_status_future(
        mut child: tokio::process::Child,
        timeout: Option<Duration>,
        command: String,
    ) -> Pin<Box<dyn futures::Future<Output = Result<ExitStatus, ProcessError>> + Send>> {
        Box::pin(async move {
            let status = match timeout {
                Some(duration) => match tokio::time::timeout(duration, child.wait()).await {
                    Ok(Ok(status)) => Self::parse_exit_status(status),
                    Ok(Err(e)) => return Err(ProcessError::IoError { command, source: e }),
                    Err(_) => {
                        // kill_on_drop is set, but reap eagerly so the pid is released
                        let _ = child.kill().await;
                        ExitStatus::Timeout
                    }
                },
                None => match child.wait().await {
                    Ok(status) => Self::parse_exit_status(status),
                    Err(e) => return Err(ProcessError::IoError { command, source: e }),
                },
            };

            Ok(status)
        })
    }

    fn log_command_start(command: &ProcessCommand) {
        tracing::debug!("Executing subprocess: {}", command.display());

        if !command.env.is_empty() {
            tracing::trace!(
                "Explicit environment variables for '{}': {:?}",
                command.program,
                command.env.keys().collect::<Vec<_>>()
            );
        }

        if let Some(ref dir) = command.working_dir {
            tracing::trace!("Working directory: {:?}", dir);
        }
    }

    /// Configure the command with an isolated environment and working directory
    fn configure_command(
        command: &ProcessCommand,
    ) -> Result<tokio::process::Command, ProcessError> {
        let mut cmd = tokio::process::Command::new(&command.program);

        // New process group so cancellation can signal the whole tree
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd.args(&command.args);

        // Nothing from the parent leaks into a workspace except what is listed below
        cmd.env_clear();
        Self::preserve_essential_env(&mut cmd, &command.program)?;

        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.kill_on_drop(true);
        Self::configure_stdio(&mut cmd, command);
        Ok(cmd)
    }

    /// Preserve essential system environment variables.
    /// PATH is mandatory; spawning without it would fail in confusing ways.
    fn preserve_essential_env(
        cmd: &mut tokio::process::Command,
        program: &str,
    ) -> Result<(), ProcessError> {
        let path = std::env::var("PATH").map_err(|e| {
            tracing::error!(
                "Required environment variable PATH is not available for command '{}': {:?}",
                program,
                e
            );
            ProcessError::InternalError {
                message: format!(
                    "Critical environment variable PATH is not available (required for '{program}')"
                ),
            }
        })?;
        cmd.env("PATH", path);

        let mut missing = Vec::new();
        for var in ["HOME", "USER", "SHELL", "TMPDIR", "TERM", "LANG", "LC_ALL"] {
            match std::env::var(var) {
                Ok(value) => {
                    cmd.env(var, value);
                }
                Err(_) => missing.push(var),
            }
        }

        if !missing.is_empty() {
            tracing::trace!(
                "Optional env vars not available for '{}': {}",
                program,
                missing.join(", ")
            );
        }

        Ok(())
    }

    fn configure_stdio(cmd: &mut tokio::process::Command, command: &ProcessCommand) {
        if command.stdin.is_some() {
            cmd.stdin(std::process::Stdio::piped());
        } else {
            cmd.stdin(std::process::Stdio::null());
        }

        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
    }

    async fn write_stdin(
        child: &mut tokio::process::Child,
        stdin_data: &str,
    ) -> Result<(), ProcessError> {
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(stdin_data.as_bytes())
                .await
                .map_err(ProcessError::Io)?;
            stdin.shutdown().await.map_err(ProcessError::Io)?;
        }
        Ok(())
    }

    async fn wait_with_timeout(
        child: tokio::process::Child,
        timeout: Option<Duration>,
    ) -> Result<std::process::Output, ProcessError> {
        match timeout {
            Some(duration) => match tokio::time::timeout(duration, child.wait_with_output()).await
            {
                Ok(result) => result.map_err(ProcessError::Io),
                Err(_) => Err(ProcessError::Timeout(duration)),
            },
            None => child.wait_with_output().await.map_err(ProcessError::Io),
        }
    }

    fn parse_exit_status(status: std::process::ExitStatus) -> ExitStatus {
        if status.success() {
            ExitStatus::Success
        } else if let Some(code) = status.code() {
            ExitStatus::Error(code)
        } else {
            Self::parse_signal_status(status)
        }
    }

    #[cfg(unix)]
    fn parse_signal_status(status: std::process::ExitStatus) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        match status.signal() {
            Some(signal) => ExitStatus::Signal(signal),
            None => ExitStatus::Error(1),
        }
    }

    #[cfg(not(unix))]
    fn parse_signal_status(_status: std::process::ExitStatus) -> ExitStatus {
        ExitStatus::Error(1)
    }

    fn log_result(result: &ProcessOutput, command: &ProcessCommand) {
        match &result.status {
            ExitStatus::Success => {
                tracing::debug!(
                    "Subprocess completed successfully in {:?}: {}",
                    result.duration,
                    command.display()
                );
            }
            ExitStatus::Error(code) => {
                tracing::debug!(
                    "Subprocess failed with exit code {} in {:?}: {}",
                    code,
                    result.duration,
                    command.display()
                );
                if !result.stderr.is_empty() {
                    tracing::trace!("Stderr: {}", result.stderr);
                }
            }
            ExitStatus::Signal(signal) => {
                tracing::warn!(
                    "Subprocess terminated by signal {} in {:?}: {}",
                    signal,
                    result.duration,
                    command.display()
                );
            }
            ExitStatus::Timeout => {
                tracing::warn!(
                    "Subprocess timed out after {:?}: {}",
                    result.duration,
                    command.display()
                );
            }
        }
    }

    fn map_spawn_error(error: std::io::Error, command: &ProcessCommand) -> ProcessError {
        if error.kind() == std::io::ErrorKind::NotFound {
            ProcessError::CommandNotFound(command.program.clone())
        } else {
            ProcessError::SpawnFailed {
                command: command.display(),
                source: error,
            }
        }
    }

    fn extract_stream<T>(stream: Option<T>, stream_name: &str) -> Result<T, ProcessError> {
        stream.ok_or_else(|| ProcessError::InternalError {
            message: format!("Failed to capture {stream_name}"),
        })
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        let start = std::time::Instant::now();
        Self::log_command_start(&command);

        let mut cmd = Self::configure_command(&command)?;
        let mut child = cmd
            .spawn()
            .map_err(|e| Self::map_spawn_error(e, &command))?;

        if let Some(stdin_data) = &command.stdin {
            Self::write_stdin(&mut child, stdin_data).await?;
        }

        let output = Self::wait_with_timeout(child, command.timeout).await?;

        let result = ProcessOutput {
            status: Self::parse_exit_status(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        };

        Self::log_result(&result, &command);
        Ok(result)
    }

    async fn run_streaming(&self, command: ProcessCommand) -> Result<ProcessStream, ProcessError> {
        use tokio::io::BufReader;

        Self::log_command_start(&command);

        let mut cmd = Self::configure_command(&command)?;
        let mut child = cmd
            .spawn()
            .map_err(|e| Self::map_spawn_error(e, &command))?;

        if let Some(stdin_data) = &command.stdin {
            Self::write_stdin(&mut child, stdin_data).await?;
        }

        let pid = child.id();
        let stdout = Self::extract_stream(child.stdout.take(), "stdout")?;
        let stdout = Self::create_line_stream(BufReader::new(stdout), command.display());
        let stderr: ProcessStreamFut = match child.stderr.take() {
            Some(stderr) => Self::create_line_stream(BufReader::new(stderr), command.display()),
            None => Box::pin(futures::stream::empty()),
        };

        let status = Self::create_status_future(child, command.timeout, command.display());

        Ok(ProcessStream {
            pid,
            stdout,
            stderr,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::ProcessCommandBuilder;
    use futures::StreamExt;

    #[test]
    fn test_normalize_line() {
        assert_eq!(
            TokioProcessRunner::normalize_line("hello\r\n".to_string()),
            "hello"
        );
        assert_eq!(TokioProcessRunner::normalize_line("hello\n".to_string()), "hello");
        assert_eq!(TokioProcessRunner::normalize_line("hello".to_string()), "hello");
    }

    #[test]
    fn test_extract_stream_with_none() {
        let value: Option<i32> = None;
        match TokioProcessRunner::extract_stream(value, "test_stream") {
            Err(ProcessError::InternalError { message }) => {
                assert_eq!(message, "Failed to capture test_stream");
            }
            other => panic!("Expected InternalError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_does_not_inherit_parent_environment() {
        std::env::set_var("WORKLANE_RUNNER_LEAK_CHECK", "leaked");
        let command = ProcessCommandBuilder::new("sh")
            .args(["-c", "echo \"${WORKLANE_RUNNER_LEAK_CHECK:-absent}\""])
            .build();

        let output = TokioProcessRunner.run(command).await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.trim(), "absent");
    }

    #[tokio::test]
    async fn test_run_passes_explicit_environment() {
        let command = ProcessCommandBuilder::new("sh")
            .args(["-c", "echo \"$GIT_AUTHOR_NAME\""])
            .env("GIT_AUTHOR_NAME", "worklane")
            .build();

        let output = TokioProcessRunner.run(command).await.unwrap();
        assert_eq!(output.stdout.trim(), "worklane");
    }

    #[tokio::test]
    async fn test_run_command_not_found() {
        let command = ProcessCommandBuilder::new("nonexistent-command-12345").build();
        let result = TokioProcessRunner.run(command).await;
        assert!(matches!(result, Err(ProcessError::CommandNotFound(_))));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let command = ProcessCommandBuilder::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100))
            .build();

        let result = TokioProcessRunner.run(command).await;
        assert!(matches!(result, Err(ProcessError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_run_streaming_yields_lines_and_status() {
        let command = ProcessCommandBuilder::new("sh")
            .args(["-c", "echo one; echo two; exit 3"])
            .build();

        let stream = TokioProcessRunner.run_streaming(command).await.unwrap();
        assert!(stream.pid.is_some());

        let lines: Vec<String> = stream
            .stdout
            .filter_map(|line| async move { line.ok() })
            .collect()
            .await;
        assert_eq!(lines, vec!["one", "two"]);

        let status = stream.status.await.unwrap();
        assert_eq!(status, ExitStatus::Error(3));
    }
}
