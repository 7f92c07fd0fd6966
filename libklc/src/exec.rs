//! External process invocation.
//!
//! The storage and hypervisor adapters never spawn processes directly; they
//! go through a [`CommandRunner`] so tests can substitute scripted output.
//! Invocations are synchronous from the caller's point of view and carry no
//! timeout.  Dropping the returned future does not kill a child that has
//! already been spawned.

use async_trait::async_trait;
use tracing::debug;

use crate::error::CsiError;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr, for diagnostics.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim_end();
        let stderr = self.stderr.trim_end();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_owned(),
            (false, true) => stdout.to_owned(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

/// Runs a program to completion and captures its output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Spawn `program` with `args` and wait for it to exit.
    ///
    /// A non-zero exit is *not* an error at this level; only a failure to
    /// spawn is.  A missing program yields [`CsiError::Unavailable`].
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CsiError>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CsiError> {
        debug!(program, ?args, "spawning");
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    CsiError::Unavailable(format!("{program} not found: {e}"))
                }
                _ => CsiError::Unavailable(format!("failed to execute {program}: {e}")),
            })?;

        let output = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(program, code = ?output.code, "process exited");
        Ok(output)
    }
}
