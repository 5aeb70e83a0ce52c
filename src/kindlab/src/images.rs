/// Image preloader - pulls the images a Helm chart will need and loads them into
/// the kind nodes ahead of install.
///
/// Best effort: every per-image failure is recorded and skipped. Whatever is not
/// preloaded gets pulled by the kubelet at install time.
use crate::cni::chart_repo_tasks;
use crate::config::CiliumConfig;
use crate::error::Result;
use crate::runner::{CommandRunner, CommandSpec};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

const PULL_TIMEOUT: Duration = Duration::from_secs(600);
const LOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadStatus {
    Loaded,
    PullFailed(String),
    LoadFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOutcome {
    pub image: String,
    pub status: PreloadStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadReport {
    pub outcomes: Vec<ImageOutcome>,
}

impl PreloadReport {
    pub fn loaded(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|o| o.status == PreloadStatus::Loaded)
            .map(|o| o.image.as_str())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ImageOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status != PreloadStatus::Loaded)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded().count()
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }
}

impl fmt::Display for PreloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} image(s) preloaded, {} left to the installer",
            self.loaded_count(),
            self.failed_count()
        )
    }
}

/// Extract container `image:` references from a multi-document YAML stream
/// (typically `helm template` output). Order of first appearance, no duplicates.
pub fn extract_image_refs(rendered: &str) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut images = Vec::new();

    for document in serde_yaml::Deserializer::from_str(rendered) {
        let value = Value::deserialize(document)?;
        collect_images(&value, &mut |image| {
            let image = normalize_reference(image);
            if !image.is_empty() && seen.insert(image.clone()) {
                images.push(image);
            }
        });
    }

    Ok(images)
}

fn collect_images(value: &Value, sink: &mut dyn FnMut(&str)) {
    match value {
        Value::Mapping(map) => {
            // Container specs always carry a name next to the image
            let is_container = map.contains_key("name");
            for (key, child) in map {
                match (key.as_str(), child) {
                    (Some("image"), Value::String(image)) if is_container => sink(image),
                    _ => collect_images(child, sink),
                }
            }
        }
        Value::Sequence(items) => {
            for item in items {
                collect_images(item, sink);
            }
        }
        Value::Tagged(tagged) => collect_images(&tagged.value, sink),
        _ => {}
    }
}

/// `kind load` cannot address images by digest: drop a `@sha256:...` suffix
/// when the reference also carries a tag.
pub fn normalize_reference(image: &str) -> String {
    let image = image.trim();
    match image.split_once('@') {
        Some((name, _digest)) if has_tag(name) => name.to_string(),
        _ => image.to_string(),
    }
}

fn has_tag(name: &str) -> bool {
    // A ':' after the last '/' is a tag; before it, a registry port
    let last_segment = name.rsplit('/').next().unwrap_or(name);
    last_segment.contains(':')
}

pub struct ImagePreloader<'a> {
    runner: &'a dyn CommandRunner,
    cluster_name: &'a str,
    cilium: &'a CiliumConfig,
}

impl<'a> ImagePreloader<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        cluster_name: &'a str,
        cilium: &'a CiliumConfig,
    ) -> Self {
        Self {
            runner,
            cluster_name,
            cilium,
        }
    }

    /// Add or refresh the chart repository so the chart can be rendered on a
    /// host that has never seen it.
    pub async fn ensure_chart_repo(&self) -> Result<()> {
        for task in chart_repo_tasks(self.cilium) {
            tracing::debug!("[ImagePreloader] {}", task.display_name());
            self.runner.run_checked(&task.to_spec()).await?;
        }
        Ok(())
    }

    /// Render the chart with our values and return its image references.
    pub async fn chart_images(&self) -> Result<Vec<String>> {
        let spec = CommandSpec::new(
            "helm",
            [
                "template",
                self.cilium.release.as_str(),
                self.cilium.chart().as_str(),
                "--version",
                self.cilium.version.as_str(),
                "--namespace",
                self.cilium.namespace.as_str(),
                "--values",
            ],
        )
        .arg(self.cilium.values_path.to_string_lossy().into_owned())
        .with_timeout(Duration::from_secs(180));

        let output = self.runner.run_checked(&spec).await?;
        extract_image_refs(&output.stdout)
    }

    /// Preload the chart's images. Never fails: a chart that cannot be fetched
    /// or rendered yields an empty report.
    pub async fn preload(&self) -> PreloadReport {
        let start = std::time::Instant::now();

        if let Err(e) = self.ensure_chart_repo().await {
            tracing::warn!(
                "[ImagePreloader] Chart repository {} unavailable, skipping preload: {}",
                self.cilium.repo_name,
                e
            );
            return PreloadReport::default();
        }

        let images = match self.chart_images().await {
            Ok(images) => images,
            Err(e) => {
                tracing::warn!(
                    "[ImagePreloader] Cannot render chart images, skipping preload: {}",
                    e
                );
                return PreloadReport::default();
            }
        };

        tracing::info!(
            "[ImagePreloader] Preloading {} image(s) into {}",
            images.len(),
            self.cluster_name
        );

        let report = self.preload_images(&images).await;

        for failure in report.failed() {
            tracing::warn!(
                "[ImagePreloader] {} not preloaded: {:?}",
                failure.image,
                failure.status
            );
        }
        tracing::info!(
            "[TIMING] Image preload completed in {}ms: {}",
            start.elapsed().as_millis(),
            report
        );
        report
    }

    /// Pull (unless already local) and load each image, recording every outcome.
    pub async fn preload_images(&self, images: &[String]) -> PreloadReport {
        let mut report = PreloadReport::default();

        for image in images {
            let status = match self.ensure_local(image).await {
                Err(reason) => PreloadStatus::PullFailed(reason),
                Ok(()) => match self.load(image).await {
                    Ok(()) => PreloadStatus::Loaded,
                    Err(reason) => PreloadStatus::LoadFailed(reason),
                },
            };
            tracing::debug!("[ImagePreloader] {}: {:?}", image, status);
            report.outcomes.push(ImageOutcome {
                image: image.clone(),
                status,
            });
        }

        report
    }

    async fn ensure_local(&self, image: &str) -> std::result::Result<(), String> {
        let inspect = CommandSpec::new("docker", ["image", "inspect", "--format", "{{.Id}}", image])
            .with_timeout(Duration::from_secs(30));
        if let Ok(output) = self.runner.run(&inspect).await {
            if output.success() {
                tracing::debug!("[ImagePreloader] {} already present locally", image);
                return Ok(());
            }
        }

        tracing::info!("[ImagePreloader] Pulling {}", image);
        let pull = CommandSpec::new("docker", ["pull", image]).with_timeout(PULL_TIMEOUT);
        match self.runner.run(&pull).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(output.last_error_line().to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn load(&self, image: &str) -> std::result::Result<(), String> {
        let spec = CommandSpec::new(
            "kind",
            ["load", "docker-image", image, "--name", self.cluster_name],
        )
        .with_timeout(LOAD_TIMEOUT);
        match self.runner.run(&spec).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(output.last_error_line().to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}
