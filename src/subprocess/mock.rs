use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::error::ProcessError;
use super::runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, ProcessStream};

type ArgsMatcher = Box<dyn Fn(&[String]) -> bool + Send + Sync>;

/// Scriptable process runner. Expectations are matched in registration order;
/// an expectation limited with `times(n)` is skipped once it has been used up,
/// which lets tests script a sequence of responses for the same command.
#[derive(Clone)]
pub struct MockProcessRunner {
    expectations: Arc<Mutex<Vec<MockExpectation>>>,
    call_history: Arc<Mutex<Vec<ProcessCommand>>>,
}

struct MockExpectation {
    program: String,
    args_matcher: Option<ArgsMatcher>,
    response: MockResponse,
    times_called: usize,
    expected_times: Option<usize>,
    delay: Duration,
}

#[derive(Clone)]
enum MockResponse {
    Output(ProcessOutput),
    Timeout(Duration),
    NotFound,
}

pub struct MockCommandConfig {
    runner: MockProcessRunner,
    expectation: MockExpectation,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockProcessRunner {
    pub fn new() -> Self {
        Self {
            expectations: Arc::new(Mutex::new(Vec::new())),
            call_history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn expect_command(&mut self, program: &str) -> MockCommandConfig {
        MockCommandConfig {
            runner: self.clone(),
            expectation: MockExpectation {
                program: program.to_string(),
                args_matcher: None,
                response: MockResponse::Output(ProcessOutput {
                    status: ExitStatus::Success,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: Duration::from_millis(10),
                }),
                times_called: 0,
                expected_times: None,
                delay: Duration::ZERO,
            },
        }
    }

    pub fn verify_called(&self, program: &str, times: usize) -> bool {
        let history = lock(&self.call_history);
        let count = history.iter().filter(|cmd| cmd.program == program).count();
        count == times
    }

    pub fn get_call_history(&self) -> Vec<ProcessCommand> {
        lock(&self.call_history).clone()
    }

    /// Argument vectors of every recorded call, in call order
    pub fn recorded_args(&self) -> Vec<Vec<String>> {
        lock(&self.call_history)
            .iter()
            .map(|cmd| cmd.args.clone())
            .collect()
    }

    /// Index of the first recorded call whose arguments start with `prefix`
    pub fn position_of(&self, prefix: &[&str]) -> Option<usize> {
        lock(&self.call_history).iter().position(|cmd| {
            cmd.args.len() >= prefix.len()
                && cmd.args.iter().zip(prefix.iter()).all(|(a, p)| a == p)
        })
    }

    async fn respond(&self, command: &ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        let (delay, result) = self.match_expectation(command);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }

    fn match_expectation(
        &self,
        command: &ProcessCommand,
    ) -> (Duration, Result<ProcessOutput, ProcessError>) {
        lock(&self.call_history).push(command.clone());

        let mut expectations = lock(&self.expectations);

        for expectation in expectations.iter_mut() {
            if expectation.program != command.program {
                continue;
            }

            if let Some(ref args_matcher) = expectation.args_matcher {
                if !(args_matcher)(&command.args) {
                    continue;
                }
            }

            if let Some(expected) = expectation.expected_times {
                if expectation.times_called >= expected {
                    continue;
                }
            }

            expectation.times_called += 1;

            let result = match &expectation.response {
                MockResponse::Output(output) => Ok(output.clone()),
                MockResponse::Timeout(duration) => Err(ProcessError::Timeout(*duration)),
                MockResponse::NotFound => Err(ProcessError::CommandNotFound(command.program.clone())),
            };
            return (expectation.delay, result);
        }

        (
            Duration::ZERO,
            Err(ProcessError::MockExpectationNotMet(format!(
                "No expectation found for command: {} {:?}",
                command.program, command.args
            ))),
        )
    }
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        self.respond(&command).await
    }

    async fn run_streaming(&self, command: ProcessCommand) -> Result<ProcessStream, ProcessError> {
        let output = self.respond(&command).await?;

        let stdout: Vec<Result<String, ProcessError>> =
            output.stdout.lines().map(|l| Ok(l.to_string())).collect();
        let stderr: Vec<Result<String, ProcessError>> =
            output.stderr.lines().map(|l| Ok(l.to_string())).collect();
        let status = output.status;

        Ok(ProcessStream {
            pid: None,
            stdout: Box::pin(futures::stream::iter(stdout)),
            stderr: Box::pin(futures::stream::iter(stderr)),
            status: Box::pin(async move { Ok(status) }),
        })
    }
}

impl MockCommandConfig {
    pub fn with_args<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.expectation.args_matcher = Some(Box::new(matcher));
        self
    }

    fn output_mut(&mut self) -> &mut ProcessOutput {
        if !matches!(self.expectation.response, MockResponse::Output(_)) {
            self.expectation.response = MockResponse::Output(ProcessOutput {
                status: ExitStatus::Success,
                stdout: String::new(),
                stderr: String::new(),
                duration: Duration::from_millis(10),
            });
        }
        match &mut self.expectation.response {
            MockResponse::Output(output) => output,
            _ => unreachable!("response was just set to an output"),
        }
    }

    pub fn returns_stdout(mut self, stdout: &str) -> Self {
        self.output_mut().stdout = stdout.to_string();
        self
    }

    pub fn returns_stderr(mut self, stderr: &str) -> Self {
        self.output_mut().stderr = stderr.to_string();
        self
    }

    pub fn returns_exit_code(mut self, code: i32) -> Self {
        self.output_mut().status = if code == 0 {
            ExitStatus::Success
        } else {
            ExitStatus::Error(code)
        };
        self
    }

    pub fn returns_success(mut self) -> Self {
        self.output_mut().status = ExitStatus::Success;
        self
    }

    pub fn returns_timeout(mut self, after: Duration) -> Self {
        self.expectation.response = MockResponse::Timeout(after);
        self
    }

    pub fn returns_not_found(mut self) -> Self {
        self.expectation.response = MockResponse::NotFound;
        self
    }

    /// Hold the response back for `delay`
    pub fn responds_after(mut self, delay: Duration) -> Self {
        self.expectation.delay = delay;
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.expectation.expected_times = Some(n);
        self
    }

    pub fn finish(self) {
        lock(&self.runner.expectations).push(self.expectation);
    }
}

impl Default for MockProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::ProcessCommandBuilder;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_exhausted_expectations_fall_through_in_order() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("status"))
            .returns_stdout(" M file.rs\n")
            .times(1)
            .finish();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("status"))
            .returns_stdout("")
            .finish();

        let cmd = ProcessCommandBuilder::new("git").arg("status").build();
        let first = mock.run(cmd.clone()).await.unwrap();
        let second = mock.run(cmd).await.unwrap();

        assert_eq!(first.stdout, " M file.rs\n");
        assert_eq!(second.stdout, "");
        assert!(mock.verify_called("git", 2));
    }

    #[tokio::test]
    async fn test_unmatched_command_is_an_error() {
        let mock = MockProcessRunner::new();
        let cmd = ProcessCommandBuilder::new("git").arg("log").build();
        assert!(matches!(
            mock.run(cmd).await,
            Err(ProcessError::MockExpectationNotMet(_))
        ));
        assert_eq!(mock.get_call_history().len(), 1);
    }

    #[tokio::test]
    async fn test_streaming_replays_stdout_lines() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("ralph")
            .returns_stdout("Iteration 1\nIteration 2\n")
            .returns_exit_code(0)
            .finish();

        let stream = mock
            .run_streaming(ProcessCommandBuilder::new("ralph").build())
            .await
            .unwrap();
        let lines: Vec<String> = stream
            .stdout
            .filter_map(|l| async move { l.ok() })
            .collect()
            .await;
        assert_eq!(lines, vec!["Iteration 1", "Iteration 2"]);
        assert_eq!(stream.status.await.unwrap(), ExitStatus::Success);
    }

    #[test]
    fn test_position_of_matches_prefix() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("git").finish();
        tokio_test::block_on(async {
            let _ = mock
                .run(ProcessCommandBuilder::new("git").args(["add", "-A"]).build())
                .await;
            let _ = mock
                .run(ProcessCommandBuilder::new("git").args(["commit", "-m", "x"]).build())
                .await;
        });
        assert_eq!(mock.position_of(&["commit"]), Some(1));
        assert_eq!(mock.position_of(&["worktree", "prune"]), None);
    }
}
