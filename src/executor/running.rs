//! Bookkeeping for executions in flight and cancellation

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::subprocess::{ExitStatus, ProcessError, ProcessStream};

struct RunningTask {
    pid: Option<u32>,
    cancel: Arc<Notify>,
}

#[derive(Default)]
pub struct RunningTasks {
    tasks: Mutex<HashMap<String, RunningTask>>,
}

impl RunningTasks {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, RunningTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a running execution; the returned handle fires on `cancel`
    pub fn register(&self, task_id: &str, pid: Option<u32>) -> Arc<Notify> {
        let cancel = Arc::new(Notify::new());
        self.lock().insert(
            task_id.to_string(),
            RunningTask {
                pid,
                cancel: Arc::clone(&cancel),
            },
        );
        cancel
    }

    pub fn finish(&self, task_id: &str) {
        self.lock().remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Signal the execution of `task_id` to stop and SIGTERM its process group
    pub fn cancel(&self, task_id: &str) -> bool {
        let Some(task) = self.lock().remove(task_id) else {
            return false;
        };
        task.cancel.notify_one();
        if let Some(pid) = task.pid {
            terminate_group(pid);
        }
        true
    }
}

#[cfg(unix)]
fn terminate_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => debug!("Sent SIGTERM to process group {}", pid),
        Err(e) => warn!("Failed to signal process group {}: {}", pid, e),
    }
}

#[cfg(not(unix))]
fn terminate_group(pid: u32) {
    debug!("Process group signalling unsupported; {} is killed on drop", pid);
}

#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub stdout: String,
    pub stderr: String,
    pub status: Option<ExitStatus>,
    pub error: Option<ProcessError>,
    pub cancelled: bool,
}

/// Drain a process stream, passing each stdout line to `on_line`, until the
/// process exits or `cancel` fires. On cancellation the stream is dropped,
/// which kills the child.
pub async fn drive<F>(stream: ProcessStream, cancel: Arc<Notify>, mut on_line: F) -> StreamOutcome
where
    F: FnMut(&str) + Send,
{
    let ProcessStream {
        mut stdout,
        mut stderr,
        status,
        ..
    } = stream;

    let read_stdout = async {
        let mut text = String::new();
        while let Some(line) = stdout.next().await {
            match line {
                Ok(line) => {
                    on_line(&line);
                    text.push_str(&line);
                    text.push('\n');
                }
                Err(e) => {
                    debug!("stdout read failed: {}", e);
                    break;
                }
            }
        }
        text
    };
    let read_stderr = async {
        let mut text = String::new();
        while let Some(Ok(line)) = stderr.next().await {
            text.push_str(&line);
            text.push('\n');
        }
        text
    };
    let run = async {
        let (stdout, stderr) = tokio::join!(read_stdout, read_stderr);
        (stdout, stderr, status.await)
    };

    tokio::select! {
        (stdout, stderr, status) = run => match status {
            Ok(status) => StreamOutcome {
                stdout,
                stderr,
                status: Some(status),
                ..StreamOutcome::default()
            },
            Err(error) => StreamOutcome {
                stdout,
                stderr,
                error: Some(error),
                ..StreamOutcome::default()
            },
        },
        _ = cancel.notified() => StreamOutcome {
            cancelled: true,
            ..StreamOutcome::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::{MockProcessRunner, ProcessCommandBuilder, ProcessRunner};

    #[tokio::test]
    async fn test_drive_collects_output() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("agent")
            .returns_stdout("one\ntwo\n")
            .returns_stderr("warn\n")
            .returns_exit_code(2)
            .finish();
        let stream = mock
            .run_streaming(ProcessCommandBuilder::new("agent").build())
            .await
            .unwrap();

        let mut lines = Vec::new();
        let outcome = drive(stream, Arc::new(Notify::new()), |line| {
            lines.push(line.to_string())
        })
        .await;

        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(outcome.stdout, "one\ntwo\n");
        assert_eq!(outcome.stderr, "warn\n");
        assert_eq!(outcome.status, Some(ExitStatus::Error(2)));
        assert!(!outcome.cancelled);
    }

    #[test]
    fn test_cancel_unknown_task() {
        let running = RunningTasks::default();
        assert!(!running.cancel("nope"));

        let notify = running.register("t1", None);
        assert_eq!(running.len(), 1);
        assert!(running.cancel("t1"));
        assert!(running.is_empty());
        drop(notify);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_stops_a_real_process() {
        let runner = crate::subprocess::TokioProcessRunner;
        let stream = runner
            .run_streaming(ProcessCommandBuilder::new("sleep").arg("30").build())
            .await
            .unwrap();
        let running = Arc::new(RunningTasks::default());
        let cancel = running.register("t1", stream.pid);

        let canceller = Arc::clone(&running);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            canceller.cancel("t1");
        });

        let started = std::time::Instant::now();
        let outcome = drive(stream, cancel, |_| {}).await;
        assert!(outcome.cancelled);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
