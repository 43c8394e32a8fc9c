//! Typed subprocess execution.
//!
//! Every external command the orchestrator runs goes through this wrapper so
//! timeouts are enforced uniformly and stdio is always captured. A stuck
//! subprocess can never block the apply loop indefinitely.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ComposeError, ComposeResult};

/// Default deadline for subprocesses that should finish quickly.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit status; `-1` when the process was terminated by a signal.
    pub status: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the process exited zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.status == 0
    }
}

/// Timeout-enforcing runner for host commands.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    deadline: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl CommandRunner {
    /// Construct a runner with the given per-invocation deadline.
    #[must_use]
    pub const fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    /// Run a command to completion, capturing stdio.
    ///
    /// # Errors
    ///
    /// Returns an error when the process cannot be spawned or exceeds the
    /// deadline. A nonzero exit is not an error here; callers inspect
    /// [`CommandOutput::success`].
    pub async fn run(&self, program: &str, args: &[&str]) -> ComposeResult<CommandOutput> {
        self.run_with(program, args, None, &[]).await
    }

    /// Run a command in `workdir` with extra environment variables.
    ///
    /// # Errors
    ///
    /// Same contract as [`CommandRunner::run`].
    pub async fn run_with(
        &self,
        program: &str,
        args: &[&str],
        workdir: Option<&Path>,
        envs: &[(&str, &str)],
    ) -> ComposeResult<CommandOutput> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }
        for (key, value) in envs {
            command.env(key, value);
        }

        debug!(program, ?args, "running subprocess");
        let child = command.output();
        let output = timeout(self.deadline, child)
            .await
            .map_err(|_| ComposeError::Timeout {
                program: program.to_string(),
                seconds: self.deadline.as_secs(),
            })?
            .map_err(|source| ComposeError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run a command and require a zero exit status.
    ///
    /// # Errors
    ///
    /// Additionally returns [`ComposeError::CommandFailed`] carrying stderr
    /// when the process exits nonzero.
    pub async fn run_checked(&self, program: &str, args: &[&str]) -> ComposeResult<CommandOutput> {
        let output = self.run(program, args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ComposeError::CommandFailed {
                program: program.to_string(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_status() {
        let runner = CommandRunner::default();
        let output = runner.run("sh", &["-c", "echo hello"]).await.expect("run");
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let runner = CommandRunner::default();
        let output = runner
            .run("sh", &["-c", "echo oops >&2; exit 3"])
            .await
            .expect("run");
        assert!(!output.success());
        assert_eq!(output.status, 3);
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn run_checked_surfaces_stderr() {
        let runner = CommandRunner::default();
        let err = runner
            .run_checked("sh", &["-c", "echo broken >&2; exit 1"])
            .await
            .expect_err("must fail");
        match err {
            ComposeError::CommandFailed { status, stderr, .. } => {
                assert_eq!(status, 1);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_kills_stuck_processes() {
        let runner = CommandRunner::new(Duration::from_millis(200));
        let err = runner.run("sleep", &["5"]).await.expect_err("must time out");
        assert!(matches!(err, ComposeError::Timeout { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let runner = CommandRunner::default();
        let err = runner
            .run("definitely-not-a-real-binary", &[])
            .await
            .expect_err("must fail");
        assert!(matches!(err, ComposeError::Spawn { .. }));
    }
}
