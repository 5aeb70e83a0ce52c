//! External command execution.
//!
//! Every interaction with docker, kind, kubectl, helm, cilium and mkcert goes
//! through [`CommandRunner`], so the sequencer can be driven against a
//! simulated host in tests.
mod process;

pub use process::ProcessRunner;

use crate::error::{LabError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Default timeout for short tool invocations.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// A fully described external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, then stdin is closed.
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program followed by its arguments, as the process sees its argv.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Shell-like rendering for logs and error messages.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                out.push('\'');
                out.push_str(arg);
                out.push('\'');
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, falling back to stdout.
    pub fn last_error_line(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .chain(self.stdout.lines().rev())
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("No output available")
    }

    /// Convert a non-zero exit into [`LabError::CommandFailed`].
    pub fn check(self, spec: &CommandSpec) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(LabError::CommandFailed {
                command: spec.display(),
                exit_code: self.exit_code,
                detail: self.last_error_line().to_string(),
            })
        }
    }
}

/// Seam between the lab and the host's tools.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion. A non-zero exit is returned as output,
    /// not as an error; exceeding `spec.timeout` is a [`LabError::Timeout`].
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Start a command detached from this process, output appended to `log_path`.
    /// Returns the child's pid.
    async fn spawn_detached(&self, spec: &CommandSpec, log_path: &Path) -> Result<u32>;

    /// SIGTERM the process group led by `pid`. `Ok(false)` when it is already gone.
    async fn terminate(&self, pid: u32) -> Result<bool>;

    /// Command line of the live process `pid`, `None` when no such process exists.
    async fn process_args(&self, pid: u32) -> Result<Option<Vec<String>>>;

    /// Run and require a zero exit status.
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(spec).await?;
        output.check(spec)
    }
}
