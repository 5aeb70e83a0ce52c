use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LabError>;

#[derive(Error, Debug)]
pub enum LabError {
    #[error("Prerequisites not met:\n{0}")]
    Prerequisites(String),

    #[error("Required file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout {
        what: String,
        timeout: Duration,
        diagnostics: Option<String>,
    },

    #[error("Command `{command}` failed (exit {exit_code}): {detail}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        detail: String,
    },

    #[error("Failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LabError {
    /// Diagnostic dump collected when a readiness wait expired.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            LabError::Timeout { diagnostics, .. } => diagnostics.as_deref(),
            _ => None,
        }
    }

    /// Attach a diagnostic dump to a timeout, or turn a failed wait command
    /// into a timeout carrying the dump.
    pub fn into_timeout(self, what: &str, timeout: Duration, diagnostics: String) -> Self {
        let diagnostics = if diagnostics.trim().is_empty() {
            None
        } else {
            Some(diagnostics)
        };
        match self {
            LabError::Timeout { .. } | LabError::CommandFailed { .. } => LabError::Timeout {
                what: what.to_string(),
                timeout,
                diagnostics,
            },
            other => other,
        }
    }
}
