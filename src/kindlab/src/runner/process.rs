/// ProcessRunner - runs host tools as child processes
use super::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::{LabError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!("[ProcessRunner] {}", spec.display());

        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            // Dropping the wait future on timeout kills the child
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| LabError::Spawn {
            command: spec.display(),
            source,
        })?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    tracing::debug!("[ProcessRunner] stdin write failed: {}", e);
                }
            });
        }

        let start = std::time::Instant::now();
        let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    "[ProcessRunner] `{}` exceeded {:?}, killed",
                    spec.display(),
                    spec.timeout
                );
                return Err(LabError::Timeout {
                    what: format!("`{}`", spec.display()),
                    timeout: spec.timeout,
                    diagnostics: None,
                });
            }
        };

        let result = CommandOutput {
            // None means killed by a signal
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        tracing::debug!(
            "[ProcessRunner] `{}` exited {} after {}ms",
            spec.program,
            result.exit_code,
            start.elapsed().as_millis()
        );

        Ok(result)
    }

    async fn spawn_detached(&self, spec: &CommandSpec, log_path: &Path) -> Result<u32> {
        use std::os::unix::process::CommandExt;

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let log_err = log.try_clone()?;

        // std Command: the child must outlive us and must not be reaped or
        // killed when the handle drops
        let child = std::process::Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()
            .map_err(|source| LabError::Spawn {
                command: spec.display(),
                source,
            })?;

        let pid = child.id();
        tracing::info!(
            "[ProcessRunner] Started `{}` in background (pid {}, log {})",
            spec.display(),
            pid,
            log_path.display()
        );
        Ok(pid)
    }

    async fn terminate(&self, pid: u32) -> Result<bool> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pid = i32::try_from(pid)
            .map_err(|_| LabError::Discovery(format!("invalid pid {}", pid)))?;
        match killpg(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                tracing::info!("[ProcessRunner] Sent SIGTERM to process group {}", pid);
                Ok(true)
            }
            Err(Errno::ESRCH) => Ok(false),
            Err(errno) => Err(LabError::Io(std::io::Error::from(errno))),
        }
    }

    async fn process_args(&self, pid: u32) -> Result<Option<Vec<String>>> {
        let path = format!("/proc/{}/cmdline", pid);
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Some(parse_cmdline(&raw))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// `/proc/<pid>/cmdline` is argv joined and terminated by NUL bytes.
fn parse_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}
