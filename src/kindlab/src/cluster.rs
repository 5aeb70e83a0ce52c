/// Cluster lifecycle - stale cluster/container detection, teardown and creation via kind
use crate::config::ClusterConfig;
use crate::error::{LabError, Result};
use crate::runner::{CommandRunner, CommandSpec};
use crate::system_check::require_files;
use crate::wait::collect_diagnostics;
use std::time::Duration;

/// Label kind puts on every node container it creates.
const KIND_CLUSTER_LABEL: &str = "io.x-k8s.kind.cluster";

pub struct ClusterManager<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a ClusterConfig,
}

impl<'a> ClusterManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a ClusterConfig) -> Self {
        Self { runner, config }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Whether kind knows a cluster with our name.
    pub async fn exists(&self) -> Result<bool> {
        let spec = CommandSpec::new("kind", ["get", "clusters"]);
        let output = self.runner.run_checked(&spec).await?;
        Ok(parse_cluster_list(&output.stdout)
            .iter()
            .any(|c| c == &self.config.name))
    }

    /// Node containers labelled for this cluster, running or not.
    pub async fn node_containers(&self) -> Result<Vec<String>> {
        let filter = format!("label={}={}", KIND_CLUSTER_LABEL, self.config.name);
        let spec = CommandSpec::new(
            "docker",
            ["ps", "-a", "--filter", filter.as_str(), "--format", "{{.Names}}"],
        );
        let output = self.runner.run_checked(&spec).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Delete the cluster and any node containers kind left behind.
    /// Succeeds when there is nothing to delete.
    pub async fn delete(&self) -> Result<()> {
        if self.exists().await? {
            tracing::info!("[ClusterManager] Deleting cluster {}", self.config.name);
            let spec = CommandSpec::new("kind", ["delete", "cluster", "--name", self.name()])
                .with_timeout(Duration::from_secs(180));
            self.runner.run_checked(&spec).await?;
        } else {
            tracing::debug!(
                "[ClusterManager] Cluster {} does not exist",
                self.config.name
            );
        }
        self.remove_stale_containers().await
    }

    /// `docker rm -f` every container still labelled for this cluster.
    pub async fn remove_stale_containers(&self) -> Result<()> {
        let stale = self.node_containers().await?;
        if stale.is_empty() {
            return Ok(());
        }

        tracing::warn!(
            "[ClusterManager] Removing {} stale node container(s): {}",
            stale.len(),
            stale.join(", ")
        );
        let spec = CommandSpec::new("docker", ["rm", "-f"]).args(stale);
        self.runner.run_checked(&spec).await?;
        Ok(())
    }

    /// Tear down whatever exists under our name and create a fresh cluster
    /// from the topology file.
    pub async fn recreate(&self) -> Result<()> {
        require_files([self.config.config_path.as_path()])?;

        self.delete().await?;

        tracing::info!(
            "[ClusterManager] Creating cluster {} from {}",
            self.config.name,
            self.config.config_path.display()
        );

        // No `--wait`: nodes stay NotReady until the CNI is installed, so
        // readiness is waited on after Cilium is up
        let timeout = self.config.create_timeout();
        let mut spec = CommandSpec::new("kind", ["create", "cluster", "--name", self.name()])
            .arg("--config")
            .arg(self.config.config_path.to_string_lossy().into_owned())
            .with_timeout(timeout);
        if let Some(image) = &self.config.node_image {
            spec = spec.args(["--image", image.as_str()]);
        }

        let start = std::time::Instant::now();
        let result = match self.runner.run(&spec).await {
            Ok(output) => output.check(&spec).map(|_| ()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::info!(
                    "[TIMING] Cluster {} created in {}ms",
                    self.config.name,
                    start.elapsed().as_millis()
                );
                Ok(())
            }
            Err(e) => {
                let filter = format!("label={}={}", KIND_CLUSTER_LABEL, self.config.name);
                let dump = collect_diagnostics(
                    self.runner,
                    &[CommandSpec::new("docker", ["ps", "-a", "--filter", filter.as_str()])],
                )
                .await;
                match e {
                    LabError::Timeout { .. } => Err(e.into_timeout(
                        &format!("cluster {} to be created", self.config.name),
                        timeout,
                        dump,
                    )),
                    other => {
                        tracing::error!("[ClusterManager] Node containers:\n{}", dump);
                        Err(other)
                    }
                }
            }
        }
    }
}

/// `kind get clusters` prints one name per line, or a "No kind clusters found."
/// notice on stderr.
pub fn parse_cluster_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("No kind"))
        .map(String::from)
        .collect()
}
