//! Bring-up and teardown sequencer.
//!
//! Stages run in a fixed dependency order and fail fast: the first error stops
//! the pipeline before any dependent stage starts. Every stage converges
//! existing resources, so `deploy` can be re-run at any point.

use crate::app::AppDeployer;
use crate::background::BackgroundProcesses;
use crate::bgp::{BgpProvisioner, BgpTopology};
use crate::cluster::ClusterManager;
use crate::cni::NetworkInstaller;
use crate::config::LabConfig;
use crate::error::{LabError, Result};
use crate::images::{ImagePreloader, PreloadReport};
use crate::progress::ProgressReporter;
use crate::report::{ClusterReport, Reporter};
use crate::runner::CommandRunner;
use crate::system_check::{check_system_requirements, require_files, required_files};
use crate::template_renderer::TemplateRenderer;
use std::fmt;
use std::sync::Arc;

/// Generated state subdirectories owned by the lab.
const STATE_SUBDIRS: &[&str] = &["frr", "tls", "pids", "logs"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Prerequisites,
    Cluster,
    Images,
    Network,
    Bgp,
    Application,
    Verify,
}

impl Stage {
    pub const ORDER: [Stage; 7] = [
        Stage::Prerequisites,
        Stage::Cluster,
        Stage::Images,
        Stage::Network,
        Stage::Bgp,
        Stage::Application,
        Stage::Verify,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Prerequisites => "prerequisites",
            Stage::Cluster => "cluster",
            Stage::Images => "images",
            Stage::Network => "network",
            Stage::Bgp => "bgp",
            Stage::Application => "application",
            Stage::Verify => "verify",
        }
    }

    /// Overall progress window of the stage.
    pub fn progress_range(&self) -> (u32, u32) {
        match self {
            Stage::Prerequisites => (0, 5),
            Stage::Cluster => (5, 20),
            Stage::Images => (20, 35),
            Stage::Network => (35, 60),
            Stage::Bgp => (60, 70),
            Stage::Application => (70, 92),
            Stage::Verify => (92, 100),
        }
    }

    /// Map a stage-local percentage into the overall range.
    fn scale(&self, local: u32) -> u32 {
        let (start, end) = self.progress_range();
        start + (end - start) * local.min(100) / 100
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOptions {
    pub skip_preload: bool,
    pub skip_bgp: bool,
    /// Do not start the Hubble UI or port-forwards.
    pub no_ui: bool,
}

#[derive(Debug, Default)]
pub struct DeploySummary {
    pub completed: Vec<Stage>,
    pub skipped: Vec<Stage>,
    pub preload: Option<PreloadReport>,
    pub bgp: Option<BgpTopology>,
    pub gateway_address: Option<String>,
    pub background: Vec<(String, u32)>,
    pub report: Option<ClusterReport>,
}

pub struct Lab {
    runner: Arc<dyn CommandRunner>,
    config: LabConfig,
    renderer: TemplateRenderer,
    progress: Arc<dyn ProgressReporter>,
}

impl Lab {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: LabConfig,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            runner,
            config,
            renderer: TemplateRenderer::from_embedded()?,
            progress,
        })
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    /// Configuration for one deploy run with the CLI overrides applied.
    fn effective_config(&self, options: &DeployOptions) -> LabConfig {
        let mut config = self.config.clone();
        if options.skip_bgp {
            config.bgp.enabled = false;
        }
        if options.skip_preload {
            config.cilium.preload_images = false;
        }
        if options.no_ui {
            config.observability.hubble_ui = false;
            config.observability.port_forwards.clear();
        }
        config
    }

    fn is_skipped(stage: Stage, config: &LabConfig) -> bool {
        match stage {
            Stage::Images => !config.cilium.preload_images,
            Stage::Bgp => !config.bgp.enabled,
            _ => false,
        }
    }

    pub async fn deploy(&self, options: &DeployOptions) -> Result<DeploySummary> {
        let config = self.effective_config(options);
        let mut summary = DeploySummary::default();
        let start = std::time::Instant::now();

        tracing::info!(
            "[Lab] Deploying {} (bgp: {}, preload: {})",
            config.cluster.name,
            config.bgp.enabled,
            config.cilium.preload_images
        );

        for stage in Stage::ORDER {
            if Self::is_skipped(stage, &config) {
                tracing::info!("[Lab] Skipping stage {}", stage);
                summary.skipped.push(stage);
                continue;
            }

            let (stage_start, _) = stage.progress_range();
            self.progress
                .emit_stage(stage_start, "Starting".to_string(), stage.label());
            let stage_timer = std::time::Instant::now();

            if let Err(e) = self.run_stage(stage, &config, &mut summary).await {
                tracing::error!(
                    "[TIMING] Stage {} failed after {}ms: {}",
                    stage,
                    stage_timer.elapsed().as_millis(),
                    e
                );
                return Err(e);
            }

            tracing::info!(
                "[TIMING] Stage {} completed in {}ms",
                stage,
                stage_timer.elapsed().as_millis()
            );
            summary.completed.push(stage);
        }

        self.progress.emit(100, "Lab is ready".to_string());
        tracing::info!(
            "[TIMING] Deploy of {} completed in {}ms",
            config.cluster.name,
            start.elapsed().as_millis()
        );
        Ok(summary)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        config: &LabConfig,
        summary: &mut DeploySummary,
    ) -> Result<()> {
        let runner = self.runner.as_ref();
        let progress = |local: u32, message: &str| {
            self.progress
                .emit_stage(stage.scale(local), message.to_string(), stage.label());
        };

        match stage {
            Stage::Prerequisites => {
                check_system_requirements(runner, config)
                    .await
                    .into_result()?;
                require_files(required_files(config))?;
            }
            Stage::Cluster => {
                ClusterManager::new(runner, &config.cluster).recreate().await?;
            }
            Stage::Images => {
                let report = ImagePreloader::new(runner, &config.cluster.name, &config.cilium)
                    .preload()
                    .await;
                progress(100, &report.to_string());
                summary.preload = Some(report);
            }
            Stage::Network => {
                NetworkInstaller::new(self.runner.clone(), config, &self.renderer)
                    .install(progress)
                    .await?;
            }
            Stage::Bgp => {
                let topology = BgpProvisioner::new(runner, config, &self.renderer)
                    .provision()
                    .await?;
                summary.bgp = Some(topology);
            }
            Stage::Application => {
                let address = AppDeployer::new(self.runner.clone(), config)
                    .deploy(progress)
                    .await?;
                summary.gateway_address = Some(address);
            }
            Stage::Verify => {
                // Observability helpers are a convenience: a failed launch is not fatal
                match BackgroundProcesses::new(runner, config).start_all().await {
                    Ok(started) => summary.background = started,
                    Err(e) => tracing::warn!("[Lab] Background processes not started: {}", e),
                }
                progress(50, "Collecting cluster state");
                let report = Reporter::new(self.runner.clone(), config, &self.renderer)
                    .collect()
                    .await;
                tracing::info!("[Lab] Final state:\n{}", report);
                summary.report = Some(report);
            }
        }
        Ok(())
    }

    /// Remove everything `deploy` creates. Succeeds when nothing exists.
    pub async fn cleanup(&self) -> Result<()> {
        let runner = self.runner.as_ref();
        let start = std::time::Instant::now();
        tracing::info!("[Lab] Cleaning up {}", self.config.cluster.name);

        self.progress.emit(0, "Stopping background processes".to_string());
        let stopped = BackgroundProcesses::new(runner, &self.config).stop_all().await?;
        if stopped > 0 {
            tracing::info!("[Lab] Stopped {} background process(es)", stopped);
        }

        self.progress.emit(20, "Removing BGP router".to_string());
        BgpProvisioner::new(runner, &self.config, &self.renderer)
            .remove_router()
            .await?;

        self.progress.emit(40, "Deleting cluster".to_string());
        ClusterManager::new(runner, &self.config.cluster)
            .delete()
            .await?;

        self.progress.emit(90, "Removing generated state".to_string());
        self.remove_state()?;

        self.progress.emit(100, "Cleanup complete".to_string());
        tracing::info!(
            "[TIMING] Cleanup completed in {}ms",
            start.elapsed().as_millis()
        );
        Ok(())
    }

    fn remove_state(&self) -> Result<()> {
        let state_dir = self.config.state_dir();
        for sub in STATE_SUBDIRS {
            let path = state_dir.join(sub);
            match std::fs::remove_dir_all(&path) {
                Ok(()) => tracing::debug!("[Lab] Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        // Only removed when nothing else lives there
        let _ = std::fs::remove_dir(&state_dir);
        Ok(())
    }

    pub async fn status(&self) -> ClusterReport {
        Reporter::new(self.runner.clone(), &self.config, &self.renderer)
            .collect()
            .await
    }

    /// Address assigned to the demo Gateway.
    pub async fn gateway_address(&self) -> Result<String> {
        AppDeployer::new(self.runner.clone(), &self.config)
            .gateway_address()
            .await?
            .ok_or_else(|| {
                LabError::Discovery(format!(
                    "gateway/{} has no address yet; run `kindlab deploy` first",
                    self.config.app.gateway_name
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_ranges_are_contiguous() {
        let mut previous_end = 0;
        for stage in Stage::ORDER {
            let (start, end) = stage.progress_range();
            assert_eq!(start, previous_end, "{} does not follow its predecessor", stage);
            assert!(end > start);
            previous_end = end;
        }
        assert_eq!(previous_end, 100);
    }

    #[test]
    fn test_scale() {
        assert_eq!(Stage::Network.scale(0), 35);
        assert_eq!(Stage::Network.scale(100), 60);
        assert_eq!(Stage::Network.scale(250), 60);
        assert_eq!(Stage::Verify.scale(50), 96);
    }
}
