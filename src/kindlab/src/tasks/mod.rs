/// Provisioning tasks - the unit the workflow executor runs
mod exec_task;
mod kubectl_task;
mod lab_task;

pub use exec_task::ExecTask;
pub use kubectl_task::{KubectlTask, ManifestSource};
pub use lab_task::LabTask;
