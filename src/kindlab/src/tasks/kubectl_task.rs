/// KubectlTask - applies Kubernetes manifests
use crate::runner::CommandSpec;
use std::path::PathBuf;
use std::time::Duration;

/// Where the manifest comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// Rendered YAML, piped through stdin
    Inline(String),
    /// File or directory on disk
    Path(PathBuf),
    /// Remote URL (e.g. released CRD bundles)
    Url(String),
}

/// Task for applying Kubernetes manifests
#[derive(Debug, Clone)]
pub struct KubectlTask {
    /// Task name for logging
    pub name: String,
    pub source: ManifestSource,
    /// Namespace override; manifests usually carry their own
    pub namespace: Option<String>,
    pub timeout: Duration,
}

impl KubectlTask {
    /// Create a new apply task
    pub fn apply(name: impl Into<String>, source: ManifestSource) -> Self {
        Self {
            name: name.into(),
            source,
            namespace: None,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Get display name for logging
    pub fn display_name(&self) -> String {
        format!("kubectl/{}", self.name)
    }

    /// Build the `kubectl apply` invocation against `context`.
    pub fn to_spec(&self, context: &str) -> CommandSpec {
        let mut spec = CommandSpec::new("kubectl", ["--context", context, "apply"])
            .with_timeout(self.timeout);

        if let Some(ns) = &self.namespace {
            spec = spec.args(["--namespace", ns.as_str()]);
        }

        match &self.source {
            ManifestSource::Inline(content) => spec.args(["-f", "-"]).with_stdin(content.clone()),
            ManifestSource::Path(path) => spec.arg("-f").arg(path.to_string_lossy().into_owned()),
            ManifestSource::Url(url) => spec.args(["-f", url.as_str()]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_apply_pipes_stdin() {
        let task = KubectlTask::apply("namespace", ManifestSource::Inline("kind: Namespace".into()));
        let spec = task.to_spec("kind-lab");
        assert_eq!(spec.display(), "kubectl --context kind-lab apply -f -");
        assert_eq!(spec.stdin.as_deref(), Some("kind: Namespace"));
        assert_eq!(task.display_name(), "kubectl/namespace");
    }

    #[test]
    fn test_path_apply_in_namespace() {
        let task = KubectlTask::apply("shop", ManifestSource::Path(PathBuf::from("deploy/app/10-shop.yaml")))
            .in_namespace("demo");
        let spec = task.to_spec("kind-lab");
        assert_eq!(
            spec.args,
            vec![
                "--context",
                "kind-lab",
                "apply",
                "--namespace",
                "demo",
                "-f",
                "deploy/app/10-shop.yaml"
            ]
        );
        assert!(spec.stdin.is_none());
    }
}
