//! Prerequisite checker
//!
//! Verifies the host can run the lab before anything is touched:
//! - required CLI tools are on PATH (docker, kind, kubectl, helm, cilium, mkcert)
//! - the docker daemon answers
//!
//! Missing configuration files are a separate failure ([`require_files`]).

use crate::config::LabConfig;
use crate::error::{LabError, Result};
use crate::runner::{CommandRunner, CommandSpec};
use std::path::Path;
use std::time::Duration;

/// Result of prerequisite check
#[derive(Debug, Clone)]
pub struct SystemCheckResult {
    pub passed: bool,
    pub checks: Vec<CheckItem>,
}

/// Individual check item
#[derive(Debug, Clone)]
pub struct CheckItem {
    pub name: String,
    pub passed: bool,
    /// Optional checks are reported but never fail the run.
    pub required: bool,
    pub message: String,
    pub fix_command: Option<String>,
}

impl CheckItem {
    fn ok(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            required: true,
            message,
            fix_command: None,
        }
    }

    fn failed(name: &str, message: String, fix: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            required: true,
            message,
            fix_command: fix,
        }
    }

    fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

impl SystemCheckResult {
    pub fn from_checks(checks: Vec<CheckItem>) -> Self {
        let passed = checks.iter().all(|c| c.passed || !c.required);
        Self { passed, checks }
    }

    /// Returns a formatted error message if checks failed
    pub fn error_message(&self) -> Option<String> {
        if self.passed {
            return None;
        }

        let failed_checks: Vec<_> = self
            .checks
            .iter()
            .filter(|c| !c.passed && c.required)
            .collect();

        let mut msg = String::from("The following requirements are not satisfied:\n\n");

        for (i, check) in failed_checks.iter().enumerate() {
            msg.push_str(&format!(
                "  {}. {} - {}\n",
                i + 1,
                check.name,
                check.message
            ));
            if let Some(fix) = &check.fix_command {
                msg.push_str(&format!("     Fix: {}\n", fix));
            }
            msg.push('\n');
        }

        Some(msg)
    }

    /// Turn a failed check into [`LabError::Prerequisites`].
    pub fn into_result(self) -> Result<Self> {
        match self.error_message() {
            Some(msg) => Err(LabError::Prerequisites(msg)),
            None => Ok(self),
        }
    }
}

/// A host tool the lab drives.
struct Tool {
    name: &'static str,
    install: &'static str,
}

const TOOLS: &[Tool] = &[
    Tool {
        name: "docker",
        install: "https://docs.docker.com/engine/install/",
    },
    Tool {
        name: "kind",
        install: "go install sigs.k8s.io/kind@latest  (or https://kind.sigs.k8s.io/docs/user/quick-start/#installation)",
    },
    Tool {
        name: "kubectl",
        install: "https://kubernetes.io/docs/tasks/tools/#kubectl",
    },
    Tool {
        name: "helm",
        install: "curl https://raw.githubusercontent.com/helm/helm/main/scripts/get-helm-3 | bash",
    },
    Tool {
        name: "cilium",
        install: "https://docs.cilium.io/en/stable/gettingstarted/k8s-install-default/#install-the-cilium-cli",
    },
];

const MKCERT: Tool = Tool {
    name: "mkcert",
    install: "https://github.com/FiloSottile/mkcert#installation",
};

/// Check all prerequisites for `config`
pub async fn check_system_requirements(
    runner: &dyn CommandRunner,
    config: &LabConfig,
) -> SystemCheckResult {
    let mut checks = Vec::new();

    for tool in TOOLS {
        checks.push(check_binary(runner, tool).await);
    }

    let mkcert = check_binary(runner, &MKCERT).await;
    checks.push(if config.app.tls { mkcert } else { mkcert.optional() });

    // Only meaningful when the docker CLI exists
    if checks.first().map(|c| c.passed).unwrap_or(false) {
        checks.push(check_docker_daemon(runner).await);
    }

    let result = SystemCheckResult::from_checks(checks);
    for check in &result.checks {
        if check.passed {
            tracing::debug!("[SystemCheck] {}: {}", check.name, check.message);
        } else if check.required {
            tracing::error!("[SystemCheck] {}: {}", check.name, check.message);
        } else {
            tracing::warn!("[SystemCheck] {} (optional): {}", check.name, check.message);
        }
    }
    result
}

/// Static files every deploy passes to the tools.
pub fn required_files(config: &LabConfig) -> Vec<&Path> {
    vec![
        config.cluster.config_path.as_path(),
        config.cilium.values_path.as_path(),
        config.app.manifests_dir.as_path(),
        config.app.gateway_manifests_dir.as_path(),
    ]
}

/// Fail with [`LabError::MissingFile`] on the first missing path.
pub fn require_files<'a, I>(paths: I) -> Result<()>
where
    I: IntoIterator<Item = &'a Path>,
{
    for path in paths {
        if !path.exists() {
            return Err(LabError::MissingFile(path.to_path_buf()));
        }
    }
    Ok(())
}

/// Check if a required binary exists
async fn check_binary(runner: &dyn CommandRunner, tool: &Tool) -> CheckItem {
    let spec = CommandSpec::new("which", [tool.name]).with_timeout(Duration::from_secs(10));
    match runner.run(&spec).await {
        Ok(output) if output.success() && !output.stdout.trim().is_empty() => CheckItem::ok(
            tool.name,
            format!("Found at {}", output.stdout.trim()),
        ),
        Ok(_) => CheckItem::failed(
            tool.name,
            "Not installed".to_string(),
            Some(tool.install.to_string()),
        ),
        Err(e) => CheckItem::failed(
            tool.name,
            format!("Cannot look up binary: {}", e),
            Some(tool.install.to_string()),
        ),
    }
}

async fn check_docker_daemon(runner: &dyn CommandRunner) -> CheckItem {
    let spec = CommandSpec::new("docker", ["info", "--format", "{{.ServerVersion}}"])
        .with_timeout(Duration::from_secs(20));
    match runner.run(&spec).await {
        Ok(output) if output.success() => CheckItem::ok(
            "docker daemon",
            format!("Running (server {})", output.stdout.trim()),
        ),
        Ok(output) => CheckItem::failed(
            "docker daemon",
            format!("Not reachable: {}", output.last_error_line()),
            Some("Start Docker (e.g. `sudo systemctl start docker`) and retry".to_string()),
        ),
        Err(e) => CheckItem::failed(
            "docker daemon",
            format!("Not reachable: {}", e),
            Some("Start Docker (e.g. `sudo systemctl start docker`) and retry".to_string()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_failures_do_not_fail() {
        let result = SystemCheckResult::from_checks(vec![
            CheckItem::ok("docker", "Found at /usr/bin/docker".to_string()),
            CheckItem::failed("mkcert", "Not installed".to_string(), None).optional(),
        ]);
        assert!(result.passed);
        assert!(result.error_message().is_none());
        assert!(result.into_result().is_ok());
    }

    #[test]
    fn test_error_message_lists_fixes() {
        let result = SystemCheckResult::from_checks(vec![
            CheckItem::ok("docker", "Found".to_string()),
            CheckItem::failed(
                "kind",
                "Not installed".to_string(),
                Some("go install sigs.k8s.io/kind@latest".to_string()),
            ),
            CheckItem::failed("helm", "Not installed".to_string(), None),
        ]);
        assert!(!result.passed);

        let msg = result.error_message().unwrap();
        assert!(msg.contains("1. kind - Not installed"));
        assert!(msg.contains("Fix: go install sigs.k8s.io/kind@latest"));
        assert!(msg.contains("2. helm - Not installed"));
        assert!(!msg.contains("docker"));

        assert!(matches!(
            result.into_result(),
            Err(LabError::Prerequisites(_))
        ));
    }

    #[test]
    fn test_require_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("kind-config.yaml");
        std::fs::write(&present, "kind: Cluster").unwrap();
        let missing = dir.path().join("values.yaml");

        require_files([present.as_path()]).unwrap();
        match require_files([present.as_path(), missing.as_path()]) {
            Err(LabError::MissingFile(path)) => assert_eq!(path, missing),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
