/// Background processes - Hubble UI and port-forwards, tracked by pid file
use crate::config::{LabConfig, PortForward};
use crate::error::Result;
use crate::runner::{CommandRunner, CommandSpec};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const HUBBLE_UI: &str = "hubble-ui";

/// Contents of a pid file: the pid and the argv it was started with, so a
/// recycled pid is never mistaken for ours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidRecord {
    pub pid: u32,
    pub command: Vec<String>,
}

/// A process that keeps running after `kindlab` exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundProcess {
    pub name: String,
    pub spec: CommandSpec,
}

/// What `start_all` would launch for `config`.
pub fn planned_processes(config: &LabConfig) -> Vec<BackgroundProcess> {
    let context = config.kube_context();
    let mut processes = Vec::new();

    if config.observability.hubble_ui {
        let port = config.observability.hubble_ui_port.to_string();
        processes.push(BackgroundProcess {
            name: HUBBLE_UI.to_string(),
            spec: CommandSpec::new(
                "cilium",
                [
                    "hubble",
                    "ui",
                    "--context",
                    context.as_str(),
                    "--namespace",
                    config.cilium.namespace.as_str(),
                    "--port-forward",
                    port.as_str(),
                    "--open-browser=false",
                ],
            ),
        });
    }

    for forward in &config.observability.port_forwards {
        processes.push(port_forward(&context, forward));
    }
    processes
}

fn port_forward(context: &str, forward: &PortForward) -> BackgroundProcess {
    let ports = format!("{}:{}", forward.local_port, forward.remote_port);
    BackgroundProcess {
        name: format!("port-forward-{}", forward.name),
        spec: CommandSpec::new(
            "kubectl",
            [
                "--context",
                context,
                "port-forward",
                "--namespace",
                forward.namespace.as_str(),
                forward.target.as_str(),
                ports.as_str(),
            ],
        ),
    }
}

pub struct BackgroundProcesses<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a LabConfig,
}

impl<'a> BackgroundProcesses<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a LabConfig) -> Self {
        Self { runner, config }
    }

    fn pid_dir(&self) -> PathBuf {
        self.config.state_dir().join("pids")
    }

    fn pid_file(&self, name: &str) -> PathBuf {
        self.pid_dir().join(format!("{}.pid", name))
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.config.state_dir().join("logs").join(format!("{}.log", name))
    }

    /// (Re)start every configured process. A previous instance is stopped first.
    pub async fn start_all(&self) -> Result<Vec<(String, u32)>> {
        std::fs::create_dir_all(self.pid_dir())?;

        let mut started = Vec::new();
        for process in planned_processes(self.config) {
            self.stop(&process.name).await?;
            let pid = self
                .runner
                .spawn_detached(&process.spec, &self.log_file(&process.name))
                .await?;
            let record = PidRecord {
                pid,
                command: process.spec.argv(),
            };
            std::fs::write(self.pid_file(&process.name), serde_json::to_string(&record)?)?;
            started.push((process.name, pid));
        }
        Ok(started)
    }

    /// Terminate the process recorded under `name`, if any, and forget it.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let path = self.pid_file(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<PidRecord>(&content) {
            Ok(record) => self.terminate_recorded(name, &record).await?,
            Err(_) => tracing::warn!(
                "[Background] Ignoring unreadable pid file {}",
                path.display()
            ),
        }

        std::fs::remove_file(&path)?;
        Ok(())
    }

    /// Signal `record.pid` only while it still runs the recorded command.
    async fn terminate_recorded(&self, name: &str, record: &PidRecord) -> Result<()> {
        let pid = record.pid;
        match self.runner.process_args(pid).await? {
            None => {
                tracing::debug!("[Background] {} (pid {}) was not running", name, pid);
            }
            Some(args) if args != record.command => {
                tracing::warn!(
                    "[Background] pid {} now runs `{}`, not {}; leaving it alone",
                    pid,
                    args.join(" "),
                    name
                );
            }
            Some(_) => {
                if self.runner.terminate(pid).await? {
                    tracing::info!("[Background] Stopped {} (pid {})", name, pid);
                } else {
                    tracing::debug!("[Background] {} (pid {}) exited before SIGTERM", name, pid);
                }
            }
        }
        Ok(())
    }

    /// Stop everything with a pid file, configured or not.
    pub async fn stop_all(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(self.pid_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".pid").map(String::from)
            })
            .collect();
        names.sort();

        for name in &names {
            self.stop(name).await?;
        }
        Ok(names.len())
    }
}
