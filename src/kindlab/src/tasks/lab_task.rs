/// LabTask - unified task type for provisioning operations
use super::exec_task::ExecTask;
use super::kubectl_task::KubectlTask;

#[derive(Debug, Clone)]
pub enum LabTask {
    Exec(ExecTask),
    Kubectl(KubectlTask),
}

impl LabTask {
    pub fn display_name(&self) -> String {
        match self {
            LabTask::Exec(task) => task.display_name(),
            LabTask::Kubectl(task) => task.display_name(),
        }
    }

    pub fn exec(task: ExecTask) -> Self {
        LabTask::Exec(task)
    }

    pub fn kubectl(task: KubectlTask) -> Self {
        LabTask::Kubectl(task)
    }
}
