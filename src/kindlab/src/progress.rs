//! Progress reporting for long-running lab operations.

use serde::{Deserialize, Serialize};

/// A progress update emitted by the sequencer.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct StageProgress {
    pub percentage: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl StageProgress {
    pub fn new(percentage: u32, message: String) -> Self {
        Self {
            percentage,
            message,
            stage: None,
        }
    }
}

/// Progress reporter for provisioning operations.
pub trait ProgressReporter: Send + Sync + 'static {
    fn emit(&self, percentage: u32, message: String);

    /// Emit progress tagged with the stage it belongs to.
    fn emit_stage(&self, percentage: u32, message: String, _stage: &str) {
        self.emit(percentage, message);
    }
}

/// Writes progress through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingProgressReporter;

impl ProgressReporter for TracingProgressReporter {
    fn emit(&self, percentage: u32, message: String) {
        tracing::info!("[{:>3}%] {}", percentage.min(100), message);
    }

    fn emit_stage(&self, percentage: u32, message: String, stage: &str) {
        tracing::info!("[{:>3}%] {}: {}", percentage.min(100), stage, message);
    }
}

/// Forwards progress into a channel (used by embedders and tests).
pub struct ChannelProgressReporter {
    sender: tokio::sync::mpsc::UnboundedSender<StageProgress>,
}

impl ChannelProgressReporter {
    pub fn new(sender: tokio::sync::mpsc::UnboundedSender<StageProgress>) -> Self {
        Self { sender }
    }
}

impl ProgressReporter for ChannelProgressReporter {
    fn emit(&self, percentage: u32, message: String) {
        let _ = self.sender.send(StageProgress::new(percentage, message));
    }

    fn emit_stage(&self, percentage: u32, message: String, stage: &str) {
        let mut progress = StageProgress::new(percentage, message);
        progress.stage = Some(stage.to_string());
        let _ = self.sender.send(progress);
    }
}
