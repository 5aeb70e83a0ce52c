/// Generic workflow executor for provisioning tasks.
///
/// Runs a sequence of LabTasks against the host with progress reporting.
use crate::error::{LabError, Result};
use crate::runner::CommandRunner;
use crate::tasks::LabTask;
use std::sync::Arc;

/// Result of task execution
pub struct TaskResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl TaskResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Execution context for lab tasks: the host runner plus the kube context
/// every kubectl task targets.
pub struct TaskExecutor {
    pub runner: Arc<dyn CommandRunner>,
    pub kube_context: String,
}

impl TaskExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, kube_context: impl Into<String>) -> Self {
        Self {
            runner,
            kube_context: kube_context.into(),
        }
    }

    /// Execute a single task
    pub async fn execute(&self, task: &LabTask) -> Result<TaskResult> {
        let spec = match task {
            LabTask::Exec(exec_task) => exec_task.to_spec(),
            LabTask::Kubectl(kubectl_task) => {
                tracing::info!("[TaskExecutor] Applying {}", kubectl_task.name);
                kubectl_task.to_spec(&self.kube_context)
            }
        };

        tracing::debug!(
            "[TaskExecutor] Task '{}': {}",
            task.display_name(),
            spec.display()
        );

        let output = self.runner.run(&spec).await?;
        let task_result = TaskResult {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        };

        if task_result.success() {
            tracing::info!(
                "[TaskExecutor] Task '{}' completed successfully",
                task.display_name(),
            );
        } else {
            tracing::error!(
                "[TaskExecutor] Task '{}' failed (exit {}): {}",
                task.display_name(),
                task_result.exit_code,
                task_result.stderr.trim(),
            );
        }

        Ok(task_result)
    }
}

/// Execute a sequence of tasks with progress tracking.
/// Fail-fast: stops on the first task failure.
pub async fn run_tasks<F>(
    tasks: &[LabTask],
    executor: &TaskExecutor,
    progress_start: u32,
    progress_end: u32,
    progress_fn: F,
) -> Result<()>
where
    F: Fn(u32, &str),
{
    if tasks.is_empty() {
        return Ok(());
    }

    let total_tasks = tasks.len() as u32;
    let span = progress_end.saturating_sub(progress_start);

    for (index, task) in tasks.iter().enumerate() {
        let progress = progress_start + span.saturating_mul(index as u32) / total_tasks.max(1);
        let display_name = task.display_name();

        progress_fn(progress, &format!("Executing {}", display_name));

        let task_start = std::time::Instant::now();
        let result = executor.execute(task).await?;
        let task_duration = task_start.elapsed();

        if !result.success() {
            let last_line = result
                .stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("No output available");
            tracing::warn!(
                "[TIMING] Task {} failed after {}ms",
                display_name,
                task_duration.as_millis()
            );
            return Err(LabError::CommandFailed {
                command: display_name,
                exit_code: result.exit_code,
                detail: last_line.trim().to_string(),
            });
        }

        tracing::info!(
            "[TIMING] Task {} completed in {}ms",
            display_name,
            task_duration.as_millis()
        );

        let completion_progress = if index + 1 < tasks.len() {
            progress_start + span.saturating_mul((index + 1) as u32) / total_tasks.max(1)
        } else {
            progress_end
        };
        progress_fn(completion_progress, &format!("Completed {}", display_name));
    }

    Ok(())
}
