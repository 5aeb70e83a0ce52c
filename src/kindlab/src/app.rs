/// Application deployer - namespace, TLS secret, demo workloads and the Gateway
use crate::config::LabConfig;
use crate::error::{LabError, Result};
use crate::runner::{CommandRunner, CommandSpec};
use crate::tasks::{KubectlTask, LabTask, ManifestSource};
use crate::wait::{poll_until, wait_with_diagnostics};
use crate::workflow::{run_tasks, TaskExecutor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const ADDRESS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// `*.yaml` / `*.yml` files directly under `dir`, sorted by file name so
/// numbered manifests apply in order.
pub fn collect_manifests(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(LabError::MissingFile(dir.to_path_buf()));
    }

    let mut manifests: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    manifests.sort();
    Ok(manifests)
}

pub struct AppDeployer<'a> {
    runner: Arc<dyn CommandRunner>,
    config: &'a LabConfig,
}

impl<'a> AppDeployer<'a> {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &'a LabConfig) -> Self {
        Self { runner, config }
    }

    pub fn tls_dir(&self) -> PathBuf {
        self.config.state_dir().join("tls")
    }

    /// Namespace, TLS secret, workloads, Gateway. Returns the gateway address.
    pub async fn deploy<F>(&self, progress_fn: F) -> Result<String>
    where
        F: Fn(u32, &str),
    {
        let app = &self.config.app;
        let workloads = collect_manifests(&app.manifests_dir)?;
        let gateway = collect_manifests(&app.gateway_manifests_dir)?;

        progress_fn(0, &format!("Ensuring namespace {}", app.namespace));
        self.ensure_namespace().await?;

        if app.tls {
            progress_fn(5, "Issuing TLS certificate");
            self.ensure_tls_secret().await?;
        }

        let executor = TaskExecutor::new(self.runner.clone(), self.config.kube_context());
        run_tasks(&self.apply_tasks(&workloads), &executor, 10, 40, &progress_fn).await?;

        progress_fn(40, "Waiting for deployments");
        self.wait_deployments().await?;

        run_tasks(&self.apply_tasks(&gateway), &executor, 60, 75, &progress_fn).await?;

        progress_fn(75, &format!("Waiting for gateway {}", app.gateway_name));
        self.wait_gateway_programmed().await?;

        progress_fn(90, "Waiting for gateway address");
        self.wait_gateway_address().await
    }

    fn apply_tasks(&self, manifests: &[PathBuf]) -> Vec<LabTask> {
        manifests
            .iter()
            .map(|path| {
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                LabTask::kubectl(
                    KubectlTask::apply(name, ManifestSource::Path(path.clone()))
                        .in_namespace(&self.config.app.namespace),
                )
            })
            .collect()
    }

    /// `kubectl create namespace --dry-run=client -o yaml | kubectl apply -f -`
    pub async fn ensure_namespace(&self) -> Result<()> {
        let context = self.config.kube_context();
        let generate = CommandSpec::new(
            "kubectl",
            [
                "--context",
                context.as_str(),
                "create",
                "namespace",
                self.config.app.namespace.as_str(),
                "--dry-run=client",
                "-o",
                "yaml",
            ],
        );
        self.apply_generated("namespace", generate, None).await
    }

    /// Issue a certificate for every demo hostname with mkcert (reused when
    /// already on disk) and store it as a TLS secret.
    pub async fn ensure_tls_secret(&self) -> Result<()> {
        let dir = self.tls_dir();
        std::fs::create_dir_all(&dir)?;
        let cert = dir.join("tls.crt");
        let key = dir.join("tls.key");

        if cert.exists() && key.exists() {
            tracing::info!(
                "[AppDeployer] Reusing certificate in {}",
                dir.display()
            );
        } else {
            tracing::info!(
                "[AppDeployer] Issuing certificate for {}",
                self.config.app.hostnames.join(", ")
            );
            let mkcert = CommandSpec::new("mkcert", ["-cert-file"])
                .arg(cert.to_string_lossy().into_owned())
                .arg("-key-file")
                .arg(key.to_string_lossy().into_owned())
                .args(self.config.app.hostnames.iter().cloned());
            self.runner.run_checked(&mkcert).await?;
        }

        let context = self.config.kube_context();
        let cert_arg = format!("--cert={}", cert.display());
        let key_arg = format!("--key={}", key.display());
        let generate = CommandSpec::new(
            "kubectl",
            [
                "--context",
                context.as_str(),
                "create",
                "secret",
                "tls",
                self.config.app.tls_secret.as_str(),
                cert_arg.as_str(),
                key_arg.as_str(),
                "--dry-run=client",
                "-o",
                "yaml",
            ],
        );
        self.apply_generated("tls-secret", generate, Some(&self.config.app.namespace))
            .await
    }

    async fn apply_generated(
        &self,
        name: &str,
        generate: CommandSpec,
        namespace: Option<&str>,
    ) -> Result<()> {
        let manifest = self.runner.run_checked(&generate).await?.stdout;
        let mut task = KubectlTask::apply(name, ManifestSource::Inline(manifest));
        if let Some(ns) = namespace {
            task = task.in_namespace(ns);
        }
        self.runner
            .run_checked(&task.to_spec(&self.config.kube_context()))
            .await?;
        Ok(())
    }

    pub async fn wait_deployments(&self) -> Result<()> {
        let timeout = self.config.app.ready_timeout();
        let context = self.config.kube_context();
        let namespace = self.config.app.namespace.as_str();
        let wait_timeout = format!("--timeout={}s", timeout.as_secs());
        let wait = CommandSpec::new(
            "kubectl",
            [
                "--context",
                context.as_str(),
                "wait",
                "--for=condition=Available",
                "deployment",
                "--all",
                "--namespace",
                namespace,
                wait_timeout.as_str(),
            ],
        );
        let diagnostics = [
            CommandSpec::new(
                "kubectl",
                [
                    "--context",
                    context.as_str(),
                    "get",
                    "pods",
                    "--namespace",
                    namespace,
                    "-o",
                    "wide",
                ],
            ),
            CommandSpec::new(
                "kubectl",
                [
                    "--context",
                    context.as_str(),
                    "get",
                    "events",
                    "--namespace",
                    namespace,
                    "--sort-by=.lastTimestamp",
                ],
            ),
        ];
        wait_with_diagnostics(
            self.runner.as_ref(),
            &format!("deployments in {}", namespace),
            wait,
            timeout,
            &diagnostics,
        )
        .await?;
        Ok(())
    }

    pub async fn wait_gateway_programmed(&self) -> Result<()> {
        let timeout = self.config.app.ready_timeout();
        let context = self.config.kube_context();
        let namespace = self.config.app.namespace.as_str();
        let gateway = format!("gateway/{}", self.config.app.gateway_name);
        let wait_timeout = format!("--timeout={}s", timeout.as_secs());
        let wait = CommandSpec::new(
            "kubectl",
            [
                "--context",
                context.as_str(),
                "wait",
                "--for=condition=Programmed",
                gateway.as_str(),
                "--namespace",
                namespace,
                wait_timeout.as_str(),
            ],
        );
        let diagnostics = [
            CommandSpec::new(
                "kubectl",
                [
                    "--context",
                    context.as_str(),
                    "describe",
                    gateway.as_str(),
                    "--namespace",
                    namespace,
                ],
            ),
            CommandSpec::new(
                "kubectl",
                [
                    "--context",
                    context.as_str(),
                    "get",
                    "httproutes",
                    "--namespace",
                    namespace,
                ],
            ),
        ];
        wait_with_diagnostics(
            self.runner.as_ref(),
            &format!("{} to be programmed", gateway),
            wait,
            timeout,
            &diagnostics,
        )
        .await?;
        Ok(())
    }

    /// Address currently assigned to the Gateway, if any.
    pub async fn gateway_address(&self) -> Result<Option<String>> {
        let context = self.config.kube_context();
        let spec = CommandSpec::new(
            "kubectl",
            [
                "--context",
                context.as_str(),
                "get",
                "gateway",
                self.config.app.gateway_name.as_str(),
                "--namespace",
                self.config.app.namespace.as_str(),
                "-o",
                "jsonpath={.status.addresses[0].value}",
            ],
        );
        let output = self.runner.run_checked(&spec).await?;
        let address = output.stdout.trim();
        Ok((!address.is_empty()).then(|| address.to_string()))
    }

    pub async fn wait_gateway_address(&self) -> Result<String> {
        let what = format!("address on gateway/{}", self.config.app.gateway_name);
        let address = poll_until(
            &what,
            self.config.app.ready_timeout(),
            ADDRESS_POLL_INTERVAL,
            || self.gateway_address(),
        )
        .await?;
        tracing::info!(
            "[AppDeployer] Gateway {} is reachable at {}",
            self.config.app.gateway_name,
            address
        );
        Ok(address)
    }
}
